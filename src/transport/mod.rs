// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! The message-bus transport seam (spec.md §4.1's "external collaborator"
//! sibling for the bus side: the underlying message-bus client). [`Bus`] is
//! implemented twice: [`amqp::AmqpBus`] talks to a real broker over `lapin`;
//! [`local::LocalBus`] is an in-process fanout used by tests so the full
//! protocol can be exercised deterministically without a running broker,
//! following this codebase's pluggable-backend convention (`CacheProvider`
//! had `InMemoryCache`/`RedisCache`; here it's `LocalBus`/`AmqpBus`).

pub mod amqp;
pub mod local;

use crate::config::AmqpConnectOptions;
use crate::errors::CacheResult;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use amqp::AmqpBus;
pub use local::LocalBus;

/// A message delivered to this instance's bound queue, as observed by the
/// consumer loop (spec.md §6.2).
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Raw payload bytes.
    pub payload: Bytes,
    /// The `x-cache-id` header value carried by the message.
    pub cache_id_header: String,
}

/// One connected episode: a publisher handle, an inbound delivery stream,
/// and a signal that fires once when the episode ends (error or broker
/// close). The supervisor tears all three down together on reconnect or
/// close (spec.md §4.4).
pub struct Session {
    /// Handle used to publish outgoing invalidation messages.
    pub publisher: Box<dyn Publisher>,
    /// Inbound deliveries from this instance's exclusive queue.
    pub inbound: mpsc::Receiver<Delivery>,
    /// Resolves once this episode's connection has failed or been closed by
    /// the broker (spec.md §7 item 4: consumer cancellation is equivalent to
    /// connection loss).
    pub closed: Box<dyn ConnectionWatch>,
}

/// Publishes outgoing invalidation messages on a dedicated channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to the fanout exchange, tagged with the
    /// originator's `cache_id` (spec.md §6.2).
    async fn publish(&self, payload: Bytes, cache_id: &str) -> CacheResult<()>;

    /// Close this publisher's channel (and, for transports where the two are
    /// coupled, the underlying connection).
    async fn close(&self) -> CacheResult<()>;
}

/// Signals that a connected episode has ended.
#[async_trait]
pub trait ConnectionWatch: Send + Sync {
    /// Resolves once the connection episode has ended (error, broker close,
    /// or consumer cancellation).
    async fn closed(&self);
}

/// Establishes the exchange/queue topology and returns a connected
/// [`Session`] (spec.md §6.2: fanout exchange, per-instance exclusive
/// auto-delete queue bound with an empty routing key, `noAck` consumer
/// tagged with `cache_id`).
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Connect, declare topology, and begin consuming.
    async fn connect(
        &self,
        options: &AmqpConnectOptions,
        exchange: &str,
        cache_id: &str,
    ) -> CacheResult<Session>;
}
