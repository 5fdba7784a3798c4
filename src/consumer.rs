// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module implements the inbound path of the manager: subscription
//! registration, the per-delivery dispatch loop, and the acknowledgment
//! policy. A handler that returns `Ok` acknowledges the delivery; a handler
//! that returns `Err` negatively acknowledges it with requeue, so the message
//! goes back to the queue for redelivery. A permanently failing message
//! therefore loops between delivery and requeue; there is no dead-letter
//! routing and no retry cap.
//!
//! With prefetch pinned at 1 and a dispatch loop that settles each delivery
//! before polling the next, a subscription processes at most one message at a
//! time. Handler failures are caught per message and converted into the
//! requeue decision; they never tear down the subscription.

use crate::{errors::AmqpError, manager::ConnectionManager, otel};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions},
    types::FieldTable,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-message callback registered through
/// [`subscribe`](ConnectionManager::subscribe).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// Returning `Ok` acknowledges the message; returning `Err` requeues it.
    async fn handle(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// Options for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// When true the broker settles each delivery on dispatch and the handler
    /// outcome has no effect on redelivery. Only suitable for idempotent,
    /// loss-tolerant consumers.
    pub no_ack: bool,
    /// Takes a single-consumer lock on the queue.
    pub exclusive: bool,
    /// Consumer tag reported to the broker; defaults to the connection name
    /// with a UUID suffix.
    pub consumer_tag: Option<String>,
}

/// One delivered message.
///
/// The delivery tag is an ordinal unique within the channel session that
/// produced it. Exactly one terminal action (ack or nack) is valid per tag,
/// and tags must not be retained across a reconnection.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub(crate) fn from_delivery(queue: &str, delivery: &Delivery) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            data: delivery.data.clone(),
        }
    }

    /// Deserializes the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    /// Raw payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ConnectionManager {
    /// Registers a consumer on a queue.
    ///
    /// Spawns the dispatch loop for the subscription and returns once the
    /// broker has accepted the consumer. The loop ends when the channel that
    /// backs it closes; subscriptions do not survive a reconnection and must
    /// be registered again.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    /// * `handler` - Callback invoked once per delivery
    /// * `options` - Consumer options
    ///
    /// # Returns
    /// Ok(()) once registered, `ChannelUnavailable` when not connected, or
    /// `ConsumeError` when the broker rejects the consumer
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: &SubscribeOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.cfg.connection_name, Uuid::new_v4()));

        let mut consumer = {
            let _ops = self.ops.lock().await;
            match channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: options.no_ack,
                        exclusive: options.exclusive,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(err) => {
                    error!(error = err.to_string(), queue, "error to create the consumer");
                    return Err(AmqpError::ConsumeError(queue.to_owned()));
                }
            }
        };

        info!(queue, consumer_tag = %consumer_tag, "consumer registered");

        let queue = queue.to_owned();
        let no_ack = options.no_ack;

        tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            // each delivery is settled before the next one is polled, so a
            // subscription never runs handlers concurrently
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) =
                            handle_delivery(&tracer, &queue, delivery, handler.as_ref(), no_ack)
                                .await
                        {
                            error!(error = err.to_string(), queue = %queue, "error consuming message");
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue = %queue, "consumer stream error")
                    }
                }
            }

            warn!(queue = %queue, "consumer stream closed");
        });

        Ok(())
    }

    /// Acknowledges a message outside the subscribe wrapper.
    ///
    /// For callers implementing their own acknowledgment logic. The tag is
    /// only valid on the channel session that delivered it.
    pub async fn ack_message(&self, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let _ops = self.ops.lock().await;

        match channel
            .basic_ack(msg.delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to ack message");
                Err(AmqpError::AckMessageError)
            }
            _ => {
                debug!(delivery_tag = msg.delivery_tag, "message acked");
                Ok(())
            }
        }
    }

    /// Negatively acknowledges a message outside the subscribe wrapper.
    ///
    /// # Parameters
    /// * `msg` - The delivered message
    /// * `requeue` - When true the message returns to the queue for
    ///   redelivery, otherwise it is dropped
    pub async fn nack_message(&self, msg: &ConsumerMessage, requeue: bool) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let _ops = self.ops.lock().await;

        match channel
            .basic_nack(
                msg.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to nack message");
                Err(AmqpError::NackMessageError)
            }
            _ => {
                debug!(delivery_tag = msg.delivery_tag, requeue, "message nacked");
                Ok(())
            }
        }
    }
}

/// Terminal action for one delivery.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AckDecision {
    Ack,
    Requeue,
}

/// Maps a handler outcome to the acknowledgment policy: success acks, any
/// failure requeues.
pub(crate) fn ack_decision(outcome: &Result<(), AmqpError>) -> AckDecision {
    match outcome {
        Ok(()) => AckDecision::Ack,
        Err(_) => AckDecision::Requeue,
    }
}

async fn handle_delivery(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: Delivery,
    handler: &dyn ConsumerHandler,
    no_ack: bool,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, queue);
    let msg = ConsumerMessage::from_delivery(queue, &delivery);

    debug!(
        queue,
        routing_key = %msg.routing_key,
        delivery_tag = msg.delivery_tag,
        bytes = msg.len(),
        "received message"
    );

    let outcome = handler.handle(&ctx, &msg).await;

    if no_ack {
        // the broker settled this delivery on dispatch
        if let Err(err) = &outcome {
            warn!(
                error = err.to_string(),
                queue, "handler failed for an auto-acked message"
            );
        }
        span.set_status(Status::Ok);
        return Ok(());
    }

    match ack_decision(&outcome) {
        AckDecision::Ack => {
            match delivery.ack(BasicAckOptions { multiple: false }).await {
                Err(err) => {
                    error!(error = err.to_string(), "error to ack message");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack message"),
                    });
                    Err(AmqpError::AckMessageError)
                }
                _ => {
                    debug!(queue, delivery_tag = msg.delivery_tag, "message successfully processed");
                    span.set_status(Status::Ok);
                    Ok(())
                }
            }
        }
        AckDecision::Requeue => {
            warn!(queue, delivery_tag = msg.delivery_tag, "handler failed, requeuing message");
            match delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to nack message");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to nack message"),
                    });
                    Err(AmqpError::NackMessageError)
                }
                _ => {
                    span.set_status(Status::Error {
                        description: Cow::from("handler failure, message requeued"),
                    });
                    Ok(())
                }
            }
        }
    }
}
