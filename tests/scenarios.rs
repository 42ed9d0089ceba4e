// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! End-to-end scenarios (spec.md §8) exercised against [`LocalBus`] so the
//! full invalidation protocol, coalescing, and reconnect behavior run
//! deterministically without a broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use fanout_lru_cache::config::{AmqpConnectOptions, ReconnectionOptions};
use fanout_lru_cache::events::CacheEvent;
use fanout_lru_cache::transport::LocalBus;
use fanout_lru_cache::{CacheBuilder, FanoutLruCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn amqp_options() -> AmqpConnectOptions {
    AmqpConnectOptions::new("amqp://localhost:5672/%2f").unwrap()
}

async fn instance(
    bus: &LocalBus,
    domain: &str,
    reconnection: Option<ReconnectionOptions>,
) -> FanoutLruCache<String, LocalBus> {
    let mut builder = CacheBuilder::new(domain).amqp_options(amqp_options());
    if let Some(reconnection) = reconnection {
        builder = builder.reconnection(reconnection);
    }
    builder.build_with_bus(bus.clone()).await.unwrap()
}

fn exchange_for(domain: &str) -> String {
    format!("rabbit-lru-cache-{domain}")
}

/// A listener that forwards every emitted event onto an unbounded channel,
/// so tests can await the next event instead of racing a sleep.
fn event_channel() -> (
    impl Fn(&CacheEvent) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<CacheEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |event: &CacheEvent| {
        let _ = tx.send(event.clone());
    };
    (listener, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<CacheEvent>) -> CacheEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event arrived before timeout")
        .expect("event channel stayed open")
}

// Scenario 1: concurrent misses for the same key are coalesced into a single
// loader invocation (invariant I1).
#[tokio::test]
async fn coalescing_invokes_loader_once_for_concurrent_misses() {
    let bus = LocalBus::new();
    let a = Arc::new(instance(&bus, "coalesce", None).await);
    let b = instance(&bus, "coalesce", None).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let a = Arc::clone(&a);
        let invocations = Arc::clone(&invocations);
        handles.push(tokio::spawn(async move {
            a.get_or_load("x", move |_key| {
                let invocations = Arc::clone(&invocations);
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Some("v".to_string()))
                }
            })
            .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().as_deref(), Some("v"));
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(a.has("x").await.unwrap());
    assert!(!b.has("x").await.unwrap());
}

// Scenario 2: a delete on one instance propagates and invalidates peers.
#[tokio::test]
async fn cross_instance_delete_invalidates_peer() {
    let bus = LocalBus::new();
    let a = instance(&bus, "xdel", None).await;
    let b = instance(&bus, "xdel", None).await;

    let (listener, mut rx) = event_channel();
    a.on(listener);

    a.get_or_load("x", |_| async { Ok(Some("v".to_string())) })
        .await
        .unwrap();
    assert!(a.has("x").await.unwrap());

    b.del("x").await.unwrap();

    match next_event(&mut rx).await {
        CacheEvent::InvalidationMessageReceived {
            content,
            publisher_cache_id,
        } => {
            assert_eq!(content, "del:x");
            assert_eq!(publisher_cache_id, b.cache_id());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!a.has("x").await.unwrap());
}

// Scenario 3: an instance never observes its own publishes as an
// InvalidationMessageReceived event (invariant I2).
#[tokio::test]
async fn self_echo_is_suppressed() {
    let bus = LocalBus::new();
    let a = instance(&bus, "echo", None).await;

    let (listener, mut rx) = event_channel();
    a.on(listener);

    a.del("x").await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(
        outcome.is_err(),
        "a self-originated delete must not surface InvalidationMessageReceived locally"
    );
}

// Scenario 4: a broker outage drops the supervisor into Reconnecting,
// clearing the store immediately, and recovers once the broker returns.
#[tokio::test(start_paused = true)]
async fn reconnect_with_default_options_empties_cache_and_recovers() {
    let bus = LocalBus::new();
    let a = instance(&bus, "reconnect", None).await;
    let exchange = exchange_for("reconnect");

    a.get_or_load("x", |_| async { Ok(Some("1".to_string())) })
        .await
        .unwrap();
    a.get_or_load("y", |_| async { Ok(Some("2".to_string())) })
        .await
        .unwrap();
    assert_eq!(a.get_item_count().await.unwrap(), 2);

    let (listener, mut rx) = event_channel();
    a.on(listener);

    bus.disconnect(&exchange);

    match next_event(&mut rx).await {
        CacheEvent::Reconnecting { attempt: 1, .. } => {}
        other => panic!("expected first Reconnecting event, got {other:?}"),
    }
    assert_eq!(a.get_item_count().await.unwrap(), 0);

    bus.restore(&exchange);

    loop {
        if matches!(next_event(&mut rx).await, CacheEvent::Reconnected { .. }) {
            break;
        }
    }
    assert_eq!(a.get_item_count().await.unwrap(), 0);
}

// The linear backoff grows by retryIntervalIncrease per failed attempt,
// starting at zero (spec.md §4.4).
#[tokio::test(start_paused = true)]
async fn reconnect_backoff_progresses_linearly() {
    let bus = LocalBus::new();
    let reconnection = ReconnectionOptions {
        retry_interval_increase: Duration::from_millis(1000),
        retry_interval_up_to: Duration::from_millis(60_000),
        ..ReconnectionOptions::default()
    };
    let a = instance(&bus, "backoff", Some(reconnection)).await;
    let exchange = exchange_for("backoff");

    let (listener, mut rx) = event_channel();
    a.on(listener);

    bus.disconnect(&exchange);

    let first = next_event(&mut rx).await;
    let second = next_event(&mut rx).await;

    match (first, second) {
        (
            CacheEvent::Reconnecting {
                attempt: 1,
                retry_interval: i1,
                ..
            },
            CacheEvent::Reconnecting {
                attempt: 2,
                retry_interval: i2,
                ..
            },
        ) => {
            assert_eq!(i1, Duration::from_millis(0));
            assert_eq!(i2, Duration::from_millis(1000));
        }
        other => panic!("unexpected event pair: {other:?}"),
    }

    bus.restore(&exchange);
}

// Scenario 5: with allowStaleData, a load completed while Reconnecting is
// still cached — until the next successful reattach resets the store again
// (invariant I3, SPEC_FULL.md open question 3).
#[tokio::test(start_paused = true)]
async fn allow_stale_data_keeps_loads_completed_during_reconnect() {
    let bus = LocalBus::new();
    let reconnection = ReconnectionOptions {
        allow_stale_data: true,
        ..ReconnectionOptions::default()
    };
    let a = instance(&bus, "stale", Some(reconnection)).await;
    let exchange = exchange_for("stale");

    let (listener, mut rx) = event_channel();
    a.on(listener);

    bus.disconnect(&exchange);
    match next_event(&mut rx).await {
        CacheEvent::Reconnecting { attempt: 1, .. } => {}
        other => panic!("expected first Reconnecting event, got {other:?}"),
    }

    let loaded = a
        .get_or_load("z", |_| async { Ok(Some("v".to_string())) })
        .await
        .unwrap();
    assert_eq!(loaded.as_deref(), Some("v"));
    assert!(a.has("z").await.unwrap());

    bus.restore(&exchange);
    loop {
        if matches!(next_event(&mut rx).await, CacheEvent::Reconnected { .. }) {
            break;
        }
    }
    assert_eq!(a.get_item_count().await.unwrap(), 0);
}

// Without allowStaleData, a load completed while Reconnecting is returned to
// the caller but never stored.
#[tokio::test(start_paused = true)]
async fn default_options_never_cache_loads_completed_during_reconnect() {
    let bus = LocalBus::new();
    let a = instance(&bus, "nostale", None).await;
    let exchange = exchange_for("nostale");

    let (listener, mut rx) = event_channel();
    a.on(listener);

    bus.disconnect(&exchange);
    match next_event(&mut rx).await {
        CacheEvent::Reconnecting { attempt: 1, .. } => {}
        other => panic!("expected first Reconnecting event, got {other:?}"),
    }

    let loaded = a
        .get_or_load("z", |_| async { Ok(Some("v".to_string())) })
        .await
        .unwrap();
    assert_eq!(loaded.as_deref(), Some("v"));
    assert!(!a.has("z").await.unwrap());

    bus.restore(&exchange);
}

// Scenario 6: reset() broadcasts to peers and clears their store.
#[tokio::test]
async fn reset_broadcast_clears_peer_and_emits_event() {
    let bus = LocalBus::new();
    let a = instance(&bus, "resetbroadcast", None).await;
    let b = instance(&bus, "resetbroadcast", None).await;

    a.get_or_load("x", |_| async { Ok(Some("1".to_string())) })
        .await
        .unwrap();
    b.get_or_load("y", |_| async { Ok(Some("2".to_string())) })
        .await
        .unwrap();

    let (listener, mut rx) = event_channel();
    b.on(listener);

    a.reset().await.unwrap();

    match next_event(&mut rx).await {
        CacheEvent::InvalidationMessageReceived {
            content,
            publisher_cache_id,
        } => {
            assert_eq!(content, "reset");
            assert_eq!(publisher_cache_id, a.cache_id());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(b.get_item_count().await.unwrap(), 0);
}

// Scenario 7: closing mid-reconnect halts the retry loop and subsequent
// calls observe the closing error.
#[tokio::test(start_paused = true)]
async fn close_during_reconnect_stops_the_retry_loop() {
    let bus = LocalBus::new();
    let a = instance(&bus, "closewhilereconnecting", None).await;
    let exchange = exchange_for("closewhilereconnecting");

    let (listener, mut rx) = event_channel();
    a.on(listener);

    bus.disconnect(&exchange);
    match next_event(&mut rx).await {
        CacheEvent::Reconnecting { attempt: 1, .. } => {}
        other => panic!("expected first Reconnecting event, got {other:?}"),
    }

    a.close().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(
        outcome.is_err() || outcome.unwrap().is_none(),
        "no further Reconnecting/Reconnected events after close"
    );

    let err = a.del("x").await.unwrap_err();
    assert!(err.is_closing());
}

// close() is idempotent: a second call is a no-op (SPEC_FULL.md open
// question 1).
#[tokio::test]
async fn close_is_idempotent() {
    let bus = LocalBus::new();
    let a = instance(&bus, "closetwice", None).await;

    a.close().await.unwrap();
    a.close().await.unwrap();
}

// A loader error is propagated to every coalesced waiter and the key is not
// cached.
#[tokio::test]
async fn loader_error_propagates_to_all_waiters_and_is_not_cached() {
    let bus = LocalBus::new();
    let a = Arc::new(instance(&bus, "loaderror", None).await);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let a = Arc::clone(&a);
        handles.push(tokio::spawn(async move {
            a.get_or_load("x", |_key| async {
                Err(fanout_lru_cache::errors::LoadError::from_display(
                    "backend unavailable",
                ))
            })
            .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }
    assert!(!a.has("x").await.unwrap());
}
