// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Centralized error handling for the cache facade.
//!
//! Mirrors the error taxonomy in the design notes: user precondition errors,
//! loader errors, transport errors (absorbed by the supervisor and never
//! surfaced here) and the post-`close` `ClosingError`.

use thiserror::Error;

/// Standard error categories surfaced to callers of [`crate::FanoutLruCache`].
///
/// Transport errors are intentionally absent: they never reach user-facing
/// operations, only the `reconnecting`/`reconnected` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required construction parameter was missing or invalid.
    Precondition,
    /// An operation was attempted after `close()` had begun.
    Closing,
    /// The user-supplied loader failed.
    Loader,
    /// Encoding or decoding a wire message failed.
    Protocol,
    /// An internal invariant was violated.
    Internal,
}

impl ErrorCode {
    /// Human-readable description of this error category.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Precondition => "invalid or missing construction parameter",
            Self::Closing => "operation rejected: cache is closing or closed",
            Self::Loader => "loader function failed",
            Self::Protocol => "invalidation message could not be decoded",
            Self::Internal => "internal cache error",
        }
    }
}

/// The crate's error type.
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct CacheError {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl CacheError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An operation was rejected because `close()` has begun (spec invariant I4).
    #[must_use]
    pub fn closing() -> Self {
        Self::new(ErrorCode::Closing, "cache is closing or already closed")
    }

    /// A required construction parameter was missing or empty.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Precondition, message)
    }

    /// Wrap a loader failure. Never cached, never broadcast to peers.
    #[must_use]
    pub fn loader(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Loader, message)
    }

    /// A protocol encode/decode failure.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    /// An internal invariant was violated.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// `true` if this is the "cache is closing" error (useful for callers
    /// that want to distinguish I4 rejections from genuine failures).
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        matches!(self.code, ErrorCode::Closing)
    }
}

/// Result type alias used throughout the public API.
pub type CacheResult<T> = Result<T, CacheError>;

/// A cloneable handle on a user loader's failure, so it can be broadcast to
/// every caller sharing the same inflight future (spec.md §4.2 item 5).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct LoadError(pub std::sync::Arc<str>);

impl LoadError {
    /// Wrap any displayable error as a cloneable [`LoadError`].
    pub fn from_display(err: impl std::fmt::Display) -> Self {
        Self(std::sync::Arc::from(err.to_string()))
    }
}

impl From<LoadError> for CacheError {
    fn from(err: LoadError) -> Self {
        Self::loader(err.0.to_string())
    }
}

impl From<lapin::Error> for CacheError {
    fn from(err: lapin::Error) -> Self {
        Self::internal(format!("AMQP transport error: {err}"))
    }
}
