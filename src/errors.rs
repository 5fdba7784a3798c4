// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Manager
//!
//! This module provides the set of error types for broker operations.
//! The `AmqpError` enum represents all failure scenarios that can occur during
//! connection management, topology declaration, publishing and consuming.

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// Connection-level failures (`ConnectionError`) cover transport, auth and
/// protocol negotiation problems. `ChannelUnavailable` is returned whenever an
/// operation needs a channel and none is open, which includes every call made
/// while the manager is reconnecting. `PolicyError` is raised by the
/// production guard before the broker is ever contacted.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing or negotiating the connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// An operation required a channel while none is open
    #[error("channel unavailable")]
    ChannelUnavailable,

    /// Error configuring Quality of Service or confirm mode on the channel
    #[error("failure to configure qos `{0}`")]
    QosDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error serializing or sending a message
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// A destructive operation was blocked by the production guard
    #[error("destructive operation `{0}` is not allowed in production")]
    PolicyError(String),

    /// Error setting up a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumeError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}
