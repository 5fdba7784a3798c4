// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Operations
//!
//! This module implements the declaration side of the manager: exchanges,
//! queues and the bindings between them, plus the destructive queue operations
//! gated by the production guard. It also provides `AmqpTopology`, a batch
//! installer that collects definitions and declares them in order through the
//! manager.
//!
//! Every operation requires the manager to be `Connected` and fails with
//! `ChannelUnavailable` otherwise; nothing is queued across reconnections.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    manager::ConnectionManager,
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES,
        AMQP_HEADERS_MESSAGE_TTL,
    },
};
use async_trait::async_trait;
use lapin::{
    options::{
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, ShortString},
};
use std::sync::Arc;
use tracing::{debug, error};

impl ConnectionManager {
    /// Declares an exchange.
    ///
    /// Idempotent under an identical definition; a conflicting definition for
    /// an existing exchange is rejected by the broker.
    ///
    /// # Parameters
    /// * `def` - The exchange definition
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn declare_exchange(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let _ops = self.ops.lock().await;

        debug!("creating exchange: {}", def.name);

        match channel
            .exchange_declare(
                def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    /// Declares a queue.
    ///
    /// The definition's TTL and length limits are folded into the queue
    /// argument table together with any free-form arguments. Idempotent under
    /// an identical definition.
    ///
    /// # Parameters
    /// * `def` - The queue definition
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let _ops = self.ops.lock().await;

        debug!("creating queue: {}", def.name);

        let mut queue_args = def.params.clone();

        if let Some(ttl) = def.ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max_length) = def.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max_length)),
            );
        }

        if let Some(max_length_bytes) = def.max_length_bytes {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_length_bytes)),
            );
        }

        match channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    /// Binds a queue to an exchange with a routing key.
    ///
    /// Both the queue and the exchange must already exist; the broker enforces
    /// this. Idempotent.
    ///
    /// # Parameters
    /// * `binding` - The (queue, exchange, routing key) triple
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        let _ops = self.ops.lock().await;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindQueueError(
                    binding.queue_name.to_owned(),
                    binding.exchange_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Removes all messages from a queue.
    ///
    /// Blocked by the production guard before the broker is contacted.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to purge
    ///
    /// # Returns
    /// Ok(()) on success, `PolicyError` in production, or AmqpError on failure
    pub async fn purge_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.guard_destructive("purge queue")?;

        let channel = self.channel().await?;
        let _ops = self.ops.lock().await;

        match channel.queue_purge(queue, QueuePurgeOptions::default()).await {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to purge the queue");
                Err(AmqpError::PurgeQueueError(queue.to_owned()))
            }
            _ => {
                debug!(queue, "queue purged");
                Ok(())
            }
        }
    }

    /// Deletes a queue.
    ///
    /// Blocked by the production guard before the broker is contacted.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to delete
    ///
    /// # Returns
    /// Ok(()) on success, `PolicyError` in production, or AmqpError on failure
    pub async fn delete_queue(&self, queue: &str) -> Result<(), AmqpError> {
        self.guard_destructive("delete queue")?;

        let channel = self.channel().await?;
        let _ops = self.ops.lock().await;

        match channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to delete the queue");
                Err(AmqpError::DeleteQueueError(queue.to_owned()))
            }
            _ => {
                debug!(queue, "queue deleted");
                Ok(())
            }
        }
    }

    fn guard_destructive(&self, operation: &str) -> Result<(), AmqpError> {
        if self.cfg.production {
            error!(operation, "destructive operation blocked in production");
            return Err(AmqpError::PolicyError(operation.to_owned()));
        }
        Ok(())
    }
}

/// Trait defining the interface for batch topology management.
///
/// Collect exchange, queue and binding definitions, then install them to the
/// broker in declaration order.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition<'tp>) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding<'tp>) -> Self;

    /// Installs the topology to the broker: exchanges first, then queues,
    /// then bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Batch installer for declaring a whole topology through the manager.
pub struct AmqpTopology<'tp> {
    manager: Arc<ConnectionManager>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    /// Creates a new topology installer bound to the given manager.
    ///
    /// # Parameters
    /// * `manager` - The connection manager that performs the declarations
    ///
    /// # Returns
    /// A new AmqpTopology instance
    pub fn new(manager: Arc<ConnectionManager>) -> AmqpTopology<'tp> {
        AmqpTopology {
            manager,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition<'tp>) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for def in &self.exchanges {
            self.manager.declare_exchange(def).await?;
        }

        for def in &self.queues {
            self.manager.declare_queue(def).await?;
        }

        for binding in &self.queues_binding {
            self.manager.bind_queue(binding).await?;
        }

        debug!("topology installed");
        Ok(())
    }
}
