// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Domain-separated constants, following the organization convention this
//! codebase uses elsewhere: one module per concern instead of a single
//! dumping-ground file.

/// Cache capacity, TTL and namespacing defaults.
pub mod cache;
/// Reconnection backoff defaults.
pub mod backoff;
/// Wire-level protocol constants (exchange naming, message verbs, headers).
pub mod wire;

pub use backoff::*;
pub use cache::*;
pub use wire::*;
