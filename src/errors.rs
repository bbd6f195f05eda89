// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Backbone
//!
//! `AmqpError` covers every broker-facing failure: connecting, declaring the
//! topology, publishing and settling deliveries. `HandlerError` is what
//! business handlers return; its variants carry the retryable/permanent
//! classification the consumer uses to decide between backing off and
//! dead-lettering right away.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection and setup variants are fatal at startup. Publishing variants are
/// returned synchronously to the caller, which decides whether to retry.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error loading the broker configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The connection was already closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Routing key is empty, has an empty word or carries wildcards
    #[error("invalid routing key `{0}`")]
    InvalidRoutingKey(String),

    /// Error serializing an envelope
    #[error("failure to serialize envelope `{0}`")]
    SerializeError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish was nacked by the broker")]
    PublishNacked,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error publishing a message to the dead-letter exchange
    #[error("failure to publish to dlx")]
    PublishingToDLXError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The subscription stream returned an error
    #[error("failure while consuming `{0}`")]
    ConsumerError(String),

    /// A dead-lettered message is missing the headers needed for replay
    #[error("dead letter record missing header `{0}`")]
    MissingDeadLetterHeader(String),
}

/// Errors returned by message handlers.
///
/// Only `Transient` failures are retried; every other variant goes straight to
/// the dead-letter exchange after the first attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Failure expected to go away on retry (timeouts, unavailable dependencies)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Failure that will never succeed no matter how many times it is retried
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The delivery body or the envelope data could not be decoded
    #[error("failure to parse payload: {0}")]
    Payload(String),

    /// No handler is registered for the delivery routing key
    #[error("no handler registered for routing key `{0}`")]
    Unroutable(String),
}

impl HandlerError {
    pub fn transient(msg: impl ToString) -> Self {
        HandlerError::Transient(msg.to_string())
    }

    pub fn permanent(msg: impl ToString) -> Self {
        HandlerError::Permanent(msg.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Payload(err.to_string())
    }
}
