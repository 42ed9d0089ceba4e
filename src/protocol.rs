// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Wire encoding for the invalidation protocol (spec.md §4.3, §6.2): two
//! verbs, `reset` and `del:<key>`, published to a fanout exchange. Any other
//! payload decodes to `None` — it never mutates local state, but callers
//! still surface it via `invalidation-message-received` for observability.

use crate::constants::wire::{DELETE_PREFIX, RESET_MESSAGE};
use bytes::Bytes;

/// A decoded invalidation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationMessage {
    /// Clear the entire local store.
    Reset,
    /// Remove a single key.
    Delete(String),
}

impl InvalidationMessage {
    /// Encode to the wire form (spec.md §3, §6.2).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Reset => Bytes::from_static(RESET_MESSAGE.as_bytes()),
            Self::Delete(key) => Bytes::from(format!("{DELETE_PREFIX}{key}")),
        }
    }

    /// Decode a raw payload, returning `None` for anything that is neither
    /// `reset` nor `del:<key>`.
    #[must_use]
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        if text == RESET_MESSAGE {
            Some(Self::Reset)
        } else if let Some(key) = text.strip_prefix(DELETE_PREFIX) {
            Some(Self::Delete(key.to_string()))
        } else {
            None
        }
    }
}
