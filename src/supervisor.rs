// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! The connection supervisor (spec.md §4.4): owns the bus connection and its
//! publisher/consumer channels, reacting to error or close by entering a
//! reconnect loop with linear, capped backoff. Modeled explicitly as the
//! four-state machine spec.md §9 calls for, rather than the original's two
//! booleans.

use crate::config::{AmqpConnectOptions, ReconnectionOptions};
use crate::errors::CacheResult;
use crate::events::{CacheEvent, EventBus};
use crate::logging::CacheLogger;
use crate::transport::{Bus, Delivery, Publisher, Session};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// The supervisor's four states (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorState {
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

/// Invoked for every non-self inbound delivery: decode, apply locally, and
/// emit the observable event (spec.md §4.3). Self-filtering by `cache_id`
/// happens inside this hook, not in the supervisor.
pub(crate) type InboundHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked when entering `Reconnecting` and again on successful reattach
/// (spec.md §4.4 steps 1 and 3: clear the inflight table and LRU store).
pub(crate) type ReconnectHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) struct Supervisor<B: Bus> {
    bus: B,
    options: AmqpConnectOptions,
    exchange: String,
    cache_id: String,
    reconnection: ReconnectionOptions,
    events: Arc<EventBus>,
    on_inbound: InboundHandler,
    on_reconnect_begin: ReconnectHook,
    on_reconnect_end: ReconnectHook,
    state: RwLock<SupervisorState>,
    publisher: Mutex<Option<Box<dyn Publisher>>>,
    consumer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<B: Bus> Supervisor<B> {
    /// Connect for the first time and spawn the episode's consumer and
    /// disconnect-watcher tasks.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn connect(
        bus: B,
        options: AmqpConnectOptions,
        exchange: String,
        cache_id: String,
        reconnection: ReconnectionOptions,
        events: Arc<EventBus>,
        on_inbound: InboundHandler,
        on_reconnect_begin: ReconnectHook,
        on_reconnect_end: ReconnectHook,
    ) -> CacheResult<Arc<Self>> {
        let session = bus.connect(&options, &exchange, &cache_id).await?;
        let supervisor = Arc::new(Self {
            bus,
            options,
            exchange,
            cache_id,
            reconnection,
            events,
            on_inbound,
            on_reconnect_begin,
            on_reconnect_end,
            state: RwLock::new(SupervisorState::Connected),
            publisher: Mutex::new(None),
            consumer_task: Mutex::new(None),
        });
        supervisor.adopt_session(session).await;
        Ok(supervisor)
    }

    async fn adopt_session(self: &Arc<Self>, session: Session) {
        *self.publisher.lock().await = Some(session.publisher);

        let handler = Arc::clone(&self.on_inbound);
        let mut inbound = session.inbound;
        let consumer_task = tokio::spawn(async move {
            while let Some(delivery) = inbound.recv().await {
                handler(delivery).await;
            }
        });
        *self.consumer_task.lock().await = Some(consumer_task);

        let watcher = Arc::clone(self);
        let closed = session.closed;
        tokio::spawn(async move {
            closed.closed().await;
            watcher.on_connection_lost().await;
        });
    }

    pub(crate) async fn state(&self) -> SupervisorState {
        *self.state.read().await
    }

    pub(crate) async fn is_reconnecting(&self) -> bool {
        self.state().await == SupervisorState::Reconnecting
    }

    pub(crate) async fn is_closed_or_closing(&self) -> bool {
        matches!(
            self.state().await,
            SupervisorState::Closing | SupervisorState::Closed
        )
    }

    /// Publish an outgoing invalidation message, unless currently
    /// `Reconnecting` or shutting down (spec.md §4.3: publishes are silently
    /// dropped during disconnection; the caller still applies the mutation
    /// locally regardless of what this returns).
    pub(crate) async fn publish(&self, payload: bytes::Bytes) {
        if self.is_reconnecting().await || self.is_closed_or_closing().await {
            return;
        }
        let publisher = self.publisher.lock().await;
        if let Some(publisher) = publisher.as_ref() {
            if let Err(error) = publisher.publish(payload, &self.cache_id).await {
                tracing::warn!(%error, "publish failed; awaiting disconnect notification");
            }
        }
    }

    async fn on_connection_lost(self: Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if !matches!(*state, SupervisorState::Connected) {
                // Already reconnecting, closing, or closed: the error/close
                // handler for this episode is latched to fire at most once.
                return;
            }
            *state = SupervisorState::Reconnecting;
        }
        CacheLogger::log_supervisor_transition("Connected", "Reconnecting", 1);

        (self.on_reconnect_begin)().await;

        let mut attempt: u32 = 1;
        let mut retry_interval = Duration::from_millis(0);
        self.events.emit(&CacheEvent::Reconnecting {
            error: None,
            attempt,
            retry_interval,
        });

        loop {
            if self.is_closed_or_closing().await {
                return;
            }

            tokio::time::sleep(retry_interval).await;

            match self.bus.connect(&self.options, &self.exchange, &self.cache_id).await {
                Ok(session) => {
                    if self.is_closed_or_closing().await {
                        let _ = session.publisher.close().await;
                        return;
                    }
                    self.adopt_session(session).await;
                    *self.state.write().await = SupervisorState::Connected;
                    CacheLogger::log_supervisor_transition("Reconnecting", "Connected", attempt);
                    (self.on_reconnect_end)().await;
                    self.events.emit(&CacheEvent::Reconnected {
                        error: None,
                        attempt,
                        retry_interval,
                    });
                    return;
                }
                Err(error) => {
                    if self.is_closed_or_closing().await {
                        return;
                    }
                    attempt += 1;
                    retry_interval = std::cmp::min(
                        retry_interval + self.reconnection.retry_interval_increase,
                        self.reconnection.retry_interval_up_to,
                    );
                    self.events.emit(&CacheEvent::Reconnecting {
                        error: Some(error.to_string()),
                        attempt,
                        retry_interval,
                    });
                }
            }
        }
    }

    /// `close` sequence (spec.md §4.5): mark `Closing`, cancel the consumer,
    /// close publisher/subscriber channels, close the connection. Store
    /// reset is the caller's responsibility (it owns the store, not the
    /// supervisor).
    pub(crate) async fn close(&self) -> CacheResult<()> {
        *self.state.write().await = SupervisorState::Closing;

        if let Some(task) = self.consumer_task.lock().await.take() {
            task.abort();
        }

        let publisher = self.publisher.lock().await.take();
        if let Some(publisher) = publisher {
            publisher.close().await?;
        }

        *self.state.write().await = SupervisorState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmqpConnectOptions;
    use crate::transport::LocalBus;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_hook() -> ReconnectHook {
        Arc::new(|| async {}.boxed())
    }

    fn noop_inbound() -> InboundHandler {
        Arc::new(|_delivery| async {}.boxed())
    }

    async fn connect(
        bus: LocalBus,
        exchange: &str,
        cache_id: &str,
        reconnection: ReconnectionOptions,
    ) -> Arc<Supervisor<LocalBus>> {
        Supervisor::connect(
            bus,
            AmqpConnectOptions::new("amqp://localhost/%2f").unwrap(),
            exchange.to_string(),
            cache_id.to_string(),
            reconnection,
            Arc::new(EventBus::new()),
            noop_inbound(),
            noop_hook(),
            noop_hook(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn connection_lost_guard_ignores_reentry_once_already_reconnecting() {
        let bus = LocalBus::new();
        let events = Arc::new(EventBus::new());
        let reconnecting_count = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&reconnecting_count);
        events.on(move |event| {
            if matches!(event, CacheEvent::Reconnecting { .. }) {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        let supervisor = Supervisor::connect(
            bus.clone(),
            AmqpConnectOptions::new("amqp://localhost/%2f").unwrap(),
            "ex".to_string(),
            "latch".to_string(),
            ReconnectionOptions::default(),
            Arc::clone(&events),
            noop_inbound(),
            noop_hook(),
            noop_hook(),
        )
        .await
        .unwrap();

        // Pretend a previous signal already moved this episode into
        // Reconnecting.
        *supervisor.state.write().await = SupervisorState::Reconnecting;

        // A second, redundant connection-lost signal for the same episode
        // must be a no-op: it must not re-enter the reconnect loop or emit
        // again (spec.md §4.4: the handler is latched to fire once per
        // episode).
        Arc::clone(&supervisor).on_connection_lost().await;

        assert_eq!(reconnecting_count.load(Ordering::SeqCst), 0);
        assert!(supervisor.is_reconnecting().await);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_reconnect_halts_the_retry_loop() {
        let bus = LocalBus::new();
        let supervisor = connect(bus.clone(), "ex", "closer", ReconnectionOptions::default()).await;

        bus.disconnect("ex");
        tokio::task::yield_now().await;
        assert!(supervisor.is_reconnecting().await);

        supervisor.close().await.unwrap();
        assert!(supervisor.is_closed_or_closing().await);

        // The retry loop must not silently flip back to Connected once
        // closed, even if the bus is restored afterwards.
        bus.restore("ex");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(supervisor.state().await, SupervisorState::Closed));
    }

    #[tokio::test]
    async fn publish_is_a_no_op_while_reconnecting() {
        let bus = LocalBus::new();
        let supervisor = connect(bus.clone(), "ex", "pub", ReconnectionOptions::default()).await;

        bus.disconnect("ex");
        tokio::task::yield_now().await;
        assert!(supervisor.is_reconnecting().await);

        // Must not panic or block even though there is nowhere to publish to.
        supervisor.publish(bytes::Bytes::from_static(b"reset")).await;
    }
}
