// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! The inflight table (spec.md §3, §4.2): coalesces concurrent loads for the
//! same key into a single future shared by every waiter (invariant I1). The
//! check-then-insert is a single critical section so two concurrent misses
//! for the same key can never both start a load.

use crate::errors::LoadError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use tokio::sync::Mutex;

type LoadFuture<T> = Shared<BoxFuture<'static, Result<Option<T>, LoadError>>>;

/// The outcome of [`InflightTable::get_or_start`]: whether the caller found
/// an existing load to coalesce onto, or is now responsible for driving a
/// freshly started one to completion.
pub(crate) enum Slot<T> {
    /// Another caller already has a load in flight for this key.
    Existing(LoadFuture<T>),
    /// This caller's future was just registered; it owns completion
    /// bookkeeping (storing the result, removing the entry).
    Inserted(LoadFuture<T>),
}

/// A mapping from key to in-progress load future.
pub(crate) struct InflightTable<T> {
    entries: Mutex<HashMap<String, LoadFuture<T>>>,
}

impl<T: Clone + Send + Sync + 'static> InflightTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically: return the in-progress future for `key` if one exists,
    /// otherwise register `make_future()`'s result as the new one.
    pub(crate) async fn get_or_start<F>(&self, key: &str, make_future: F) -> Slot<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Option<T>, LoadError>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            Slot::Existing(existing.clone())
        } else {
            let shared = make_future().shared();
            entries.insert(key.to_string(), shared.clone());
            Slot::Inserted(shared)
        }
    }

    /// Remove the entry for `key` unconditionally.
    pub(crate) async fn remove(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Remove the entry for `key` only if it is still exactly `future`.
    /// Returns `true` if it was removed. Used by the owning caller of a load
    /// so it never clobbers a newer entry that a concurrent `del`/`reset`/
    /// reconnect followed by another `get_or_load` registered in its place
    /// (spec.md §4.2 items 4 and 6).
    pub(crate) async fn remove_if_current(&self, key: &str, future: &LoadFuture<T>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|current| current.ptr_eq(future)) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Clear every in-progress entry (reconnect and reset paths).
    pub(crate) async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
