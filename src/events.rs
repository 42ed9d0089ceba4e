// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! Local, in-process event bus (spec.md §4.6, §6.3).
//!
//! Three observable events, dispatched synchronously and in registration
//! order. A panicking listener is isolated via `std::panic::catch_unwind` so
//! it cannot break the emitter for the remaining listeners.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Events observable by users of [`crate::FanoutLruCache`] (spec.md §6.3).
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A non-self-originated invalidation message was received.
    InvalidationMessageReceived {
        /// Raw decoded message content (`"reset"` or `"del:<key>"`, or the
        /// raw payload if it matched neither verb).
        content: String,
        /// `cacheId` of the instance that published the message.
        publisher_cache_id: String,
    },
    /// The supervisor entered the `Reconnecting` state, or a retry attempt failed.
    Reconnecting {
        /// The transport error that triggered this event, if any.
        error: Option<String>,
        /// Monotonically increasing attempt counter for this reconnect episode.
        attempt: u32,
        /// Current backoff interval.
        retry_interval: Duration,
    },
    /// The supervisor successfully reattached.
    Reconnected {
        /// The error from the final failed attempt before success, if any.
        error: Option<String>,
        /// Attempt count at which reattachment succeeded.
        attempt: u32,
        /// Backoff interval in effect when reattachment succeeded.
        retry_interval: Duration,
    },
}

type Listener = dyn Fn(&CacheEvent) + Send + Sync + 'static;

/// A handle identifying a registered listener, returned by
/// [`EventBus::on`] so it can later be passed to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    callback: Arc<Listener>,
}

/// Synchronous, fire-and-forget local event bus.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning an identity token for later removal.
    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            id,
            callback: Arc::new(callback),
        };
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(registration);
        }
        id
    }

    /// Remove a previously registered listener by identity. No-op if unknown.
    pub fn off(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|r| r.id != id);
        }
    }

    /// Dispatch an event synchronously, in registration order. Each listener
    /// invocation is isolated: a panic in one listener does not prevent the
    /// remaining listeners from running.
    pub fn emit(&self, event: &CacheEvent) {
        let callbacks: Vec<Arc<Listener>> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|r| Arc::clone(&r.callback)).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
        }
    }
}
