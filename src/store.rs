// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! The bounded LRU store (spec.md §4.1): capacity, TTL, insertion-order
//! eviction and size accounting, backed by the `lru` crate the way the
//! teacher's in-memory cache backend builds on it.

use crate::config::LruCacheOptions;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

impl<T> Entry<T> {
    fn is_expired(&self, max_age: Option<Duration>) -> bool {
        max_age.is_some_and(|ttl| self.inserted_at.elapsed() >= ttl)
    }
}

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Bounded keyed container with eviction (spec.md §4.1): `get`, `set`, `del`,
/// `reset`, `has`, `keys`, `prune`, and read-only capacity/TTL inspectors.
pub struct LruStore<T> {
    inner: Mutex<LruCache<String, Entry<T>>>,
    max: usize,
    max_age: Option<Duration>,
    allow_stale: bool,
}

impl<T: Clone + Send + Sync> LruStore<T> {
    /// Build a store from [`LruCacheOptions`]; a zero `max` falls back to
    /// the crate's default capacity rather than panicking on a zero-sized
    /// `NonZeroUsize`.
    #[must_use]
    pub fn new(options: &LruCacheOptions) -> Self {
        let capacity = NonZeroUsize::new(options.max).unwrap_or(DEFAULT_CAPACITY);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            max: capacity.get(),
            max_age: options.max_age,
            allow_stale: options.allow_stale,
        }
    }

    /// Fetch a value. Absent and (non-stale-allowed) expired entries both
    /// read as a miss.
    pub async fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock().await;
        let expired = inner.get(key).map(|entry| entry.is_expired(self.max_age));
        match expired {
            Some(true) if !self.allow_stale => {
                inner.pop(key);
                None
            }
            Some(_) => inner.get(key).map(|entry| entry.value.clone()),
            None => None,
        }
    }

    /// Insert or replace a value, refreshing both its LRU position and age.
    pub async fn set(&self, key: String, value: T) {
        let mut inner = self.inner.lock().await;
        inner.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove a single key. Returns `true` if it was present.
    pub async fn del(&self, key: &str) -> bool {
        self.inner.lock().await.pop(key).is_some()
    }

    /// Remove every entry.
    pub async fn reset(&self) {
        self.inner.lock().await.clear();
    }

    /// `true` if the key is present and readable (honoring `allow_stale`).
    pub async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// All keys currently held, most-recently-used first.
    pub async fn keys(&self) -> Vec<String> {
        self.inner.lock().await.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Eagerly purge expired entries, regardless of `allow_stale`.
    pub async fn prune(&self) {
        let Some(max_age) = self.max_age else {
            return;
        };
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| entry.is_expired(Some(max_age)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.pop(&key);
        }
    }

    /// Number of entries currently stored.
    pub async fn item_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Aggregate size. Entries are unweighted, so identical to `item_count`.
    pub async fn length(&self) -> usize {
        self.item_count().await
    }

    /// Configured capacity.
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Configured TTL, if any.
    #[must_use]
    pub const fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// Whether expired reads return the stale value instead of a miss.
    #[must_use]
    pub const fn allow_stale(&self) -> bool {
        self.allow_stale
    }
}
