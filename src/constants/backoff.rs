// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Reconnection backoff defaults (spec.md §4.4, §6.1).

/// Default ceiling for `retryInterval`, in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_UP_TO_MS: u64 = 60_000;

/// Default amount `retryInterval` grows by after each failed attempt, in milliseconds.
pub const DEFAULT_RETRY_INTERVAL_INCREASE_MS: u64 = 1_000;

/// `retryInterval` always starts at zero: the first retry is immediate.
pub const INITIAL_RETRY_INTERVAL_MS: u64 = 0;
