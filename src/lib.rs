// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! # fanout-lru-cache
//!
//! A bounded, in-process LRU cache that stays coherent across many
//! independent application instances by exchanging invalidation events over
//! a message bus using a fanout topology (spec.md §1). Each instance keeps
//! its own local cache; when any instance deletes a key or resets, a
//! notification is broadcast so peers drop the stale entry.
//!
//! Concurrent misses for the same key are coalesced into a single loader
//! invocation ([`FanoutLruCache::get_or_load`]), and transient bus outages
//! are survived by transparently reconnecting with linear, capped backoff,
//! optionally serving stale data in the meantime.
//!
//! ## Example
//!
//! ```rust,no_run
//! use fanout_lru_cache::config::{AmqpConnectOptions, LruCacheOptions};
//! use fanout_lru_cache::CacheBuilder;
//!
//! # async fn run() -> fanout_lru_cache::errors::CacheResult<()> {
//! let cache: fanout_lru_cache::FanoutLruCache<String> = CacheBuilder::new("sessions")
//!     .lru_options(LruCacheOptions { max: 10_000, ..Default::default() })
//!     .amqp_options(AmqpConnectOptions::new("amqp://localhost:5672/%2f")?)
//!     .build()
//!     .await?;
//!
//! let value = cache
//!     .get_or_load("user:42", |_key| async { Ok(Some("loaded".to_string())) })
//!     .await?;
//! assert_eq!(value.as_deref(), Some("loaded"));
//!
//! cache.close().await?;
//! # Ok(())
//! # }
//! ```

/// Typed construction parameters (spec.md §6.1), loadable explicitly or
/// from the environment.
pub mod config;
/// Domain-separated constants: cache defaults, backoff tuning, wire format.
pub mod constants;
/// The crate-wide error taxonomy (spec.md §7).
pub mod errors;
/// The local, synchronous event bus and its three observable events
/// (spec.md §4.6, §6.3).
pub mod events;
/// Structured `tracing`-based logging setup.
pub mod logging;
/// Wire encoding for the invalidation protocol (spec.md §4.3).
pub mod protocol;
/// The bounded LRU store (spec.md §4.1).
pub mod store;
/// The message-bus transport seam: a real `lapin` backend and an in-process
/// one for deterministic tests.
pub mod transport;

mod inflight;
mod supervisor;

use config::{AmqpConnectOptions, LruCacheOptions, ReconnectionOptions};
use constants::wire::EXCHANGE_PREFIX;
use errors::{CacheError, CacheResult, LoadError};
use events::{CacheEvent, EventBus, ListenerId};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use inflight::{InflightTable, Slot};
use logging::CacheLogger;
use protocol::InvalidationMessage;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use store::LruStore;
use supervisor::{ReconnectHook, Supervisor};
use transport::{AmqpBus, Bus, Delivery};
use uuid::Uuid;

/// The public surface tying the LRU store, inflight table, invalidation
/// protocol and connection supervisor together (spec.md §4.5).
///
/// `T` is the opaque cached value type; the cache never inspects or
/// serializes it. `B` is the bus transport, defaulting to the real AMQP
/// backend — pass [`transport::LocalBus`] (via [`FanoutLruCache::with_bus`])
/// to exercise the full protocol in tests without a broker.
pub struct FanoutLruCache<T, B: Bus = AmqpBus> {
    cache_id: String,
    store: Arc<LruStore<T>>,
    inflight: Arc<InflightTable<T>>,
    events: Arc<EventBus>,
    supervisor: Arc<Supervisor<B>>,
    allow_stale_data: bool,
}

impl<T> FanoutLruCache<T, AmqpBus>
where
    T: Clone + Send + Sync + 'static,
{
    /// Construct a cache backed by a real AMQP broker (spec.md §6.1).
    ///
    /// # Errors
    ///
    /// Returns a precondition error if `name` is empty, or propagates any
    /// error from the initial connection attempt.
    pub async fn new(
        name: impl Into<String>,
        lru_options: LruCacheOptions,
        amqp_options: AmqpConnectOptions,
        reconnection: Option<ReconnectionOptions>,
    ) -> CacheResult<Self> {
        Self::with_bus(AmqpBus, name, lru_options, amqp_options, reconnection).await
    }
}

impl<T, B> FanoutLruCache<T, B>
where
    T: Clone + Send + Sync + 'static,
    B: Bus,
{
    /// Construct a cache over an arbitrary [`Bus`] transport.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if `name` is empty, or propagates any
    /// error from the initial connection attempt.
    pub async fn with_bus(
        bus: B,
        name: impl Into<String>,
        lru_options: LruCacheOptions,
        amqp_options: AmqpConnectOptions,
        reconnection: Option<ReconnectionOptions>,
    ) -> CacheResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CacheError::precondition("name must not be empty"));
        }

        let cache_id = Uuid::now_v7().to_string();
        let exchange = format!("{EXCHANGE_PREFIX}{name}");
        let reconnection = reconnection.unwrap_or_default();
        let allow_stale_data = reconnection.allow_stale_data;

        let store = Arc::new(LruStore::new(&lru_options));
        let inflight = Arc::new(InflightTable::new());
        let events = Arc::new(EventBus::new());

        let on_inbound = make_inbound_handler(
            Arc::clone(&store),
            Arc::clone(&inflight),
            Arc::clone(&events),
            cache_id.clone(),
        );
        let on_reconnect_begin = make_reconnect_hook(Arc::clone(&store), Arc::clone(&inflight));
        let on_reconnect_end = make_reconnect_hook(Arc::clone(&store), Arc::clone(&inflight));

        let supervisor = Supervisor::connect(
            bus,
            amqp_options,
            exchange,
            cache_id.clone(),
            reconnection,
            Arc::clone(&events),
            on_inbound,
            on_reconnect_begin,
            on_reconnect_end,
        )
        .await?;

        Ok(Self {
            cache_id,
            store,
            inflight,
            events,
            supervisor,
            allow_stale_data,
        })
    }

    /// This instance's unique, time-ordered identifier (spec.md §3).
    #[must_use]
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    async fn ensure_open(&self) -> CacheResult<()> {
        if self.supervisor.is_closed_or_closing().await {
            Err(CacheError::closing())
        } else {
            Ok(())
        }
    }

    /// Fetch `key`, loading it via `load` on a miss. Concurrent callers
    /// requesting the same key while a load is in flight share its result
    /// (spec.md §4.2, invariant I1).
    ///
    /// A value loaded while the supervisor is `Reconnecting` is returned to
    /// the caller but only cached if `allowStaleData` is configured true
    /// (invariant I3). If the entry was invalidated mid-flight by a
    /// concurrent `del`/`reset`/reconnect, the loaded value is still
    /// returned to this caller but never stored (spec.md §4.2 item 6).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache is closing/closed, or wraps the
    /// loader's error if `load` fails.
    pub async fn get_or_load<F, Fut>(&self, key: impl Into<String>, load: F) -> CacheResult<Option<T>>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, LoadError>> + Send + 'static,
    {
        self.ensure_open().await?;
        let key = key.into();

        if let Some(value) = self.store.get(&key).await {
            return Ok(Some(value));
        }

        let key_for_load = key.clone();
        let slot = self
            .inflight
            .get_or_start(&key, move || {
                async move { load(key_for_load).await }.boxed()
                    as BoxFuture<'static, Result<Option<T>, LoadError>>
            })
            .await;

        let (shared, owns_completion) = match slot {
            Slot::Existing(shared) => {
                CacheLogger::log_coalesced_load(&key, 1);
                (shared, false)
            }
            Slot::Inserted(shared) => (shared, true),
        };

        let result = shared.clone().await;

        if owns_completion {
            match &result {
                Ok(Some(value)) => {
                    // Remove only this load's own entry: if a concurrent
                    // del/reset/reconnect evicted it mid-flight and another
                    // get_or_load(key) already registered a fresh one, that
                    // newer entry must survive untouched (spec.md §4.2 items
                    // 4 and 6).
                    let still_registered = self.inflight.remove_if_current(&key, &shared).await;
                    let reconnecting = self.supervisor.is_reconnecting().await;
                    if still_registered && (!reconnecting || self.allow_stale_data) {
                        self.store.set(key.clone(), value.clone()).await;
                    }
                }
                Ok(None) | Err(_) => {
                    self.inflight.remove_if_current(&key, &shared).await;
                }
            }
        }

        result.map_err(CacheError::from)
    }

    /// Delete a key: publish first, then apply locally (spec.md §4.3).
    /// While `Reconnecting`, the publish is silently dropped but the local
    /// mutation still happens.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn del(&self, key: impl Into<String>) -> CacheResult<()> {
        self.ensure_open().await?;
        let key = key.into();
        self.supervisor
            .publish(InvalidationMessage::Delete(key.clone()).encode())
            .await;
        self.store.del(&key).await;
        self.inflight.remove(&key).await;
        Ok(())
    }

    /// Clear the entire store: publish first, then apply locally.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn reset(&self) -> CacheResult<()> {
        self.ensure_open().await?;
        self.supervisor.publish(InvalidationMessage::Reset.encode()).await;
        self.store.reset().await;
        self.inflight.clear().await;
        Ok(())
    }

    /// `true` if `key` is present and readable.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn has(&self, key: &str) -> CacheResult<bool> {
        self.ensure_open().await?;
        Ok(self.store.has(key).await)
    }

    /// All keys currently held.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn keys(&self) -> CacheResult<Vec<String>> {
        self.ensure_open().await?;
        Ok(self.store.keys().await)
    }

    /// Whether expired reads return the stale value instead of a miss.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn does_allow_stale(&self) -> CacheResult<bool> {
        self.ensure_open().await?;
        Ok(self.store.allow_stale())
    }

    /// Number of entries currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn get_item_count(&self) -> CacheResult<usize> {
        self.ensure_open().await?;
        Ok(self.store.item_count().await)
    }

    /// Aggregate size (unweighted entries, so identical to `get_item_count`).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn get_length(&self) -> CacheResult<usize> {
        self.ensure_open().await?;
        Ok(self.store.length().await)
    }

    /// Configured capacity.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn get_max(&self) -> CacheResult<usize> {
        self.ensure_open().await?;
        Ok(self.store.max())
    }

    /// Configured TTL, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn get_max_age(&self) -> CacheResult<Option<Duration>> {
        self.ensure_open().await?;
        Ok(self.store.max_age())
    }

    /// Eagerly purge expired entries.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::closing`] if the cache is closing or closed.
    pub async fn prune(&self) -> CacheResult<()> {
        self.ensure_open().await?;
        self.store.prune().await;
        Ok(())
    }

    /// Register a listener for one of the three observable events
    /// (spec.md §6.3). Returns an identity token for [`Self::off`].
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    /// Remove a previously registered listener. No-op if unknown.
    pub fn off(&self, id: ListenerId) {
        self.events.off(id);
    }

    /// Ordered shutdown (spec.md §4.5): mark closing, cancel the consumer,
    /// close channels and connection, then reset the store. Idempotent — a
    /// second call is a no-op (spec.md §9 open question 1).
    ///
    /// # Errors
    ///
    /// Propagates any error encountered while tearing down the transport.
    pub async fn close(&self) -> CacheResult<()> {
        if self.supervisor.is_closed_or_closing().await {
            return Ok(());
        }
        self.supervisor.close().await?;
        self.inflight.clear().await;
        self.store.reset().await;
        Ok(())
    }
}

fn make_inbound_handler<T>(
    store: Arc<LruStore<T>>,
    inflight: Arc<InflightTable<T>>,
    events: Arc<EventBus>,
    own_cache_id: String,
) -> supervisor::InboundHandler
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(move |delivery: Delivery| {
        let store = Arc::clone(&store);
        let inflight = Arc::clone(&inflight);
        let events = Arc::clone(&events);
        let own_cache_id = own_cache_id.clone();
        async move {
            // Self-origin messages never mutate state and never emit
            // locally (spec.md §3 invariant I2; self-echo suppression,
            // spec.md §8 scenario 3).
            if delivery.cache_id_header == own_cache_id {
                return;
            }

            let content = String::from_utf8_lossy(&delivery.payload).into_owned();
            match InvalidationMessage::decode(&delivery.payload) {
                Some(InvalidationMessage::Reset) => {
                    store.reset().await;
                    inflight.clear().await;
                    CacheLogger::log_invalidation_applied(&own_cache_id, &delivery.cache_id_header, &content);
                }
                Some(InvalidationMessage::Delete(key)) => {
                    store.del(&key).await;
                    inflight.remove(&key).await;
                    CacheLogger::log_invalidation_applied(&own_cache_id, &delivery.cache_id_header, &content);
                }
                None => {}
            }

            events.emit(&CacheEvent::InvalidationMessageReceived {
                content,
                publisher_cache_id: delivery.cache_id_header,
            });
        }
        .boxed()
    })
}

fn make_reconnect_hook<T>(store: Arc<LruStore<T>>, inflight: Arc<InflightTable<T>>) -> ReconnectHook
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(move || {
        let store = Arc::clone(&store);
        let inflight = Arc::clone(&inflight);
        async move {
            inflight.clear().await;
            store.reset().await;
        }
        .boxed()
    })
}

/// Ergonomic construction for [`FanoutLruCache`] (spec.md §6.1).
pub struct CacheBuilder<T> {
    name: String,
    lru_options: LruCacheOptions,
    amqp_options: Option<AmqpConnectOptions>,
    reconnection: Option<ReconnectionOptions>,
    _value: PhantomData<T>,
}

impl<T> CacheBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start building a cache in the invalidation domain named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lru_options: LruCacheOptions::default(),
            amqp_options: None,
            reconnection: None,
            _value: PhantomData,
        }
    }

    /// Set the options forwarded to the underlying LRU container.
    #[must_use]
    pub fn lru_options(mut self, options: LruCacheOptions) -> Self {
        self.lru_options = options;
        self
    }

    /// Set the bus connection descriptor (required).
    #[must_use]
    pub fn amqp_options(mut self, options: AmqpConnectOptions) -> Self {
        self.amqp_options = Some(options);
        self
    }

    /// Set reconnection tuning.
    #[must_use]
    pub fn reconnection(mut self, options: ReconnectionOptions) -> Self {
        self.reconnection = Some(options);
        self
    }

    /// Build the cache against a real AMQP broker.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if `amqp_options` was never set, or any
    /// error from the initial connection attempt.
    pub async fn build(self) -> CacheResult<FanoutLruCache<T, AmqpBus>> {
        let amqp_options = self
            .amqp_options
            .ok_or_else(|| CacheError::precondition("amqpConnectOptions is required"))?;
        FanoutLruCache::new(self.name, self.lru_options, amqp_options, self.reconnection).await
    }

    /// Build the cache against an arbitrary [`Bus`] transport (tests use
    /// [`transport::LocalBus`]).
    ///
    /// # Errors
    ///
    /// Returns a precondition error if `amqp_options` was never set, or any
    /// error from the initial connection attempt.
    pub async fn build_with_bus<B: Bus>(self, bus: B) -> CacheResult<FanoutLruCache<T, B>> {
        let amqp_options = self
            .amqp_options
            .ok_or_else(|| CacheError::precondition("amqpConnectOptions is required"))?;
        FanoutLruCache::with_bus(bus, self.name, self.lru_options, amqp_options, self.reconnection).await
    }
}
