// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! This module implements the outbound path of the manager: payloads are
//! JSON-encoded and framed with a content type, a persistence flag, a send
//! timestamp, a message id and optional typed headers. The current trace
//! context is injected into the headers for distributed tracing.
//!
//! The boolean returned by the publish operations is an advisory flow-control
//! signal only: it reports whether the send was accepted for buffering, never
//! that the message was delivered. With publisher confirms enabled a broker
//! nack surfaces as `false`; callers seeing `false` should retry or slow
//! down.

use crate::{errors::AmqpError, manager::ConnectionManager, otel::AmqpTracePropagator};
use chrono::Utc;
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::{global, Context};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Typed header values accepted on outbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
    LongUint(u32),
}

/// Options for a single publish operation.
///
/// The defaults follow the manager configuration: the configured default
/// exchange, persistent delivery and a JSON content type.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Target exchange; `None` resolves to the configured default exchange
    pub exchange: Option<String>,
    /// Persistent messages survive a broker restart when the queue is durable
    pub persistent: bool,
    /// Content type stamped on the message; `None` means `application/json`
    pub content_type: Option<String>,
    /// Additional message headers
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            exchange: None,
            persistent: true,
            content_type: None,
            headers: None,
        }
    }
}

impl ConnectionManager {
    /// Publishes a message through an exchange.
    ///
    /// The payload is serialized to JSON and routed by the target exchange
    /// (the configured default unless overridden in `options`) using the
    /// given routing key.
    ///
    /// # Parameters
    /// * `routing_key` - Routing key the exchange matches bindings against
    /// * `payload` - Any serializable payload
    /// * `options` - Framing overrides
    ///
    /// # Returns
    /// The advisory flow-control boolean, or `PublishError` when the channel
    /// is unavailable or serialization fails. No internal retry is performed.
    pub async fn publish<T>(
        &self,
        routing_key: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.cfg.exchange.clone());

        self.publish_frame(&exchange, routing_key, payload, options)
            .await
    }

    /// Publishes a message straight to a named queue.
    ///
    /// Bypasses exchange routing by going through the broker's unnamed
    /// default exchange, which routes on the queue name. Same framing, return
    /// value and error semantics as [`publish`](Self::publish).
    ///
    /// # Parameters
    /// * `queue` - The destination queue
    /// * `payload` - Any serializable payload
    /// * `options` - Framing overrides (the exchange override is ignored)
    pub async fn send_to_queue<T>(
        &self,
        queue: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publish_frame("", queue, payload, options).await
    }

    async fn publish_frame<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize the payload");
                return Err(AmqpError::PublishError("payload serialization".to_owned()));
            }
        };

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                &Context::current(),
                &mut AmqpTracePropagator::new(&mut headers),
            )
        });

        if let Some(extra) = &options.headers {
            fill_headers(extra, &mut headers);
        }

        let delivery_mode = if options.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned());

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_delivery_mode(delivery_mode)
            .with_timestamp(Utc::now().timestamp() as u64)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        let channel = self
            .channel()
            .await
            .map_err(|_| AmqpError::PublishError("channel unavailable".to_owned()))?;
        let _ops = self.ops.lock().await;

        debug!(exchange, routing_key, bytes = body.len(), "publishing message");

        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishError(err.to_string()));
            }
        };

        match confirm.await {
            Ok(confirmation) => Ok(!matches!(confirmation, Confirmation::Nack(_))),
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publish confirmation");
                Err(AmqpError::PublishError(err.to_string()))
            }
        }
    }
}

/// Converts caller-supplied header values into AMQP field-table values.
fn fill_headers(
    hash_map: &HashMap<String, HeaderValues>,
    btree: &mut BTreeMap<ShortString, AMQPValue>,
) {
    for (key, value) in hash_map {
        let amqp_value = match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.clone())),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(*v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }
}
