// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Async-IO.org

//! The real `lapin`-backed transport (spec.md §6.2): fanout exchange,
//! per-instance exclusive auto-delete queue, `noAck` consumer tagged with
//! `cache_id`.

use super::{Bus, ConnectionWatch, Delivery, Publisher, Session};
use crate::config::AmqpConnectOptions;
use crate::constants::wire::CACHE_ID_HEADER;
use crate::errors::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Connection, ConnectionProperties, Channel, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// The production message-bus transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBus;

#[async_trait]
impl Bus for AmqpBus {
    async fn connect(
        &self,
        options: &AmqpConnectOptions,
        exchange: &str,
        cache_id: &str,
    ) -> CacheResult<Session> {
        let mut properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        if let Some(name) = &options.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        let connection = Connection::connect(&options.uri, properties).await?;

        let (closed_tx, closed_rx) = watch::channel(false);
        let latch = Arc::new(AtomicBool::new(false));
        let error_latch = Arc::clone(&latch);
        let error_tx = closed_tx.clone();
        connection.on_error(move |_err| {
            if error_latch.swap(true, Ordering::SeqCst) {
                return;
            }
            let _ = error_tx.send(true);
        });

        let publish_channel = connection.create_channel().await?;
        let consume_channel = connection.create_channel().await?;

        publish_channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: false,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue_name = format!("{exchange}-{cache_id}");
        consume_channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        consume_channel
            .queue_bind(
                &queue_name,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut consumer = consume_channel
            .basic_consume(
                &queue_name,
                cache_id,
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let consumer_closed_tx = closed_tx.clone();
        let consumer_latch = Arc::clone(&latch);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let cache_id_header = delivery
                            .properties
                            .headers()
                            .as_ref()
                            .and_then(|headers| {
                                headers
                                    .inner()
                                    .iter()
                                    .find(|(key, _)| key.as_str() == CACHE_ID_HEADER)
                                    .map(|(_, value)| amqp_value_to_string(value))
                            })
                            .unwrap_or_default();
                        let message = Delivery {
                            payload: Bytes::from(delivery.data),
                            cache_id_header,
                        };
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            // The consumer stream ended: broker cancellation or connection
            // loss (spec.md §7 item 4). Equivalent to a transport error.
            if !consumer_latch.swap(true, Ordering::SeqCst) {
                let _ = consumer_closed_tx.send(true);
            }
        });

        Ok(Session {
            publisher: Box::new(AmqpPublisher {
                channel: publish_channel,
                exchange: exchange.to_string(),
            }),
            inbound: inbound_rx,
            closed: Box::new(AmqpClosed(closed_rx)),
        })
    }
}

fn amqp_value_to_string(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => s.to_string(),
        AMQPValue::ShortString(s) => s.to_string(),
        other => format!("{other:?}"),
    }
}

struct AmqpPublisher {
    channel: Channel,
    exchange: String,
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, payload: Bytes, cache_id: &str) -> CacheResult<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            CACHE_ID_HEADER.into(),
            AMQPValue::LongString(cache_id.into()),
        );
        let properties = BasicProperties::default().with_headers(headers);

        self.channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        self.channel
            .close(200, "fanout-lru-cache: closing")
            .await
            .map_err(CacheError::from)
    }
}

struct AmqpClosed(watch::Receiver<bool>);

#[async_trait]
impl ConnectionWatch for AmqpClosed {
    async fn closed(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
