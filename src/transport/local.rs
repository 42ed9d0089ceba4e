// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! An in-process fanout transport for deterministic tests (SPEC_FULL.md §2):
//! multiple `FanoutLruCache` instances sharing one [`LocalBus`] observe each
//! other's publishes exactly as multiple instances bound to the same
//! RabbitMQ fanout exchange would, including receiving their own messages
//! (self-echo, filtered later by `cache_id`).

use super::{Bus, ConnectionWatch, Delivery, Publisher, Session};
use crate::config::AmqpConnectOptions;
use crate::errors::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

struct ExchangeState {
    up: bool,
    subscribers: HashMap<String, mpsc::Sender<Delivery>>,
}

impl Default for ExchangeState {
    fn default() -> Self {
        Self {
            up: true,
            subscribers: HashMap::new(),
        }
    }
}

/// A shared in-memory broker. Clone to attach multiple cache instances to
/// the same simulated fanout exchange; clones share one underlying broker
/// via `Arc`.
#[derive(Clone, Default)]
pub struct LocalBus {
    exchanges: Arc<Mutex<HashMap<String, ExchangeState>>>,
    closers: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl LocalBus {
    /// Create a fresh, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker/connection failure for every instance currently
    /// attached to `exchange` (spec.md §8 scenarios 4, 5 and 7). Existing
    /// subscriptions are dropped; `connect` fails until [`Self::restore`] is
    /// called.
    pub fn disconnect(&self, exchange: &str) {
        let mut exchanges = self.lock_exchanges();
        let state = exchanges.entry(exchange.to_string()).or_default();
        state.up = false;
        state.subscribers.clear();

        for (key, tx) in self.lock_closers().iter() {
            if key.starts_with(&format!("{exchange}-")) {
                let _ = tx.send(true);
            }
        }
    }

    /// Bring `exchange` back up so subsequent `connect` calls succeed.
    pub fn restore(&self, exchange: &str) {
        self.lock_exchanges().entry(exchange.to_string()).or_default().up = true;
    }

    fn lock_exchanges(&self) -> std::sync::MutexGuard<'_, HashMap<String, ExchangeState>> {
        self.exchanges.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_closers(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
        self.closers.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn connect(
        &self,
        _options: &AmqpConnectOptions,
        exchange: &str,
        cache_id: &str,
    ) -> CacheResult<Session> {
        let (tx, rx) = mpsc::channel(256);
        {
            let mut exchanges = self.lock_exchanges();
            let state = exchanges.entry(exchange.to_string()).or_default();
            if !state.up {
                return Err(CacheError::internal(format!(
                    "local bus: exchange {exchange} is down"
                )));
            }
            state.subscribers.insert(cache_id.to_string(), tx);
        }

        let (closed_tx, closed_rx) = watch::channel(false);
        self.lock_closers()
            .insert(format!("{exchange}-{cache_id}"), closed_tx);

        Ok(Session {
            publisher: Box::new(LocalPublisher {
                bus: self.clone(),
                exchange: exchange.to_string(),
            }),
            inbound: rx,
            closed: Box::new(LocalClosed(closed_rx)),
        })
    }
}

struct LocalPublisher {
    bus: LocalBus,
    exchange: String,
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, payload: Bytes, cache_id: &str) -> CacheResult<()> {
        let subscribers: Vec<mpsc::Sender<Delivery>> = {
            let exchanges = self.bus.lock_exchanges();
            match exchanges.get(&self.exchange) {
                Some(state) if state.up => state.subscribers.values().cloned().collect(),
                _ => {
                    return Err(CacheError::internal(format!(
                        "local bus: exchange {} is down",
                        self.exchange
                    )))
                }
            }
        };
        for subscriber in subscribers {
            let _ = subscriber
                .send(Delivery {
                    payload: payload.clone(),
                    cache_id_header: cache_id.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        Ok(())
    }
}

struct LocalClosed(watch::Receiver<bool>);

#[async_trait]
impl ConnectionWatch for LocalClosed {
    async fn closed(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
