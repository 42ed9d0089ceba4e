// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Construction-time configuration for [`crate::FanoutLruCache`] (spec.md §6.1).

/// Environment-variable loading for the pieces that make sense to override
/// at deploy time, following this codebase's `*_config::from_env()` convention.
pub mod environment;

pub use environment::{AmqpConnectOptions, LruCacheOptions, ReconnectionOptions};
