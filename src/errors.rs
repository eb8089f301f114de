// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable RabbitMQ Client
//!
//! `AmqpError` is the single error type returned by every transport, topology,
//! publisher, consumer and lifecycle operation. Application handlers report
//! failures with [`HandlerError`], which the retry engine interprets instead of
//! propagating.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants are grouped by the component that produces them: connection and
/// channel management, topology declaration, publishing, consuming and
/// settlement, and client lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A queue routes dead letters to an exchange the topology never declares
    #[error("queue `{0}` references undeclared dead letter exchange `{1}`")]
    MissingDeadLetterExchange(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing or parsing a message payload
    #[error("failure to parse payload: {0}")]
    DecodeError(String),

    /// The application handler rejected the message
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// A delivery was settled twice, or a tag that was never delivered was settled
    #[error("delivery `{0}` {1}")]
    AckProtocolError(u64, String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A bounded operation did not complete in time
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// Closing could not flush every outstanding ack/nack
    #[error("failure to close: {0} deliveries still unsettled")]
    CloseError(usize),

    /// The client or channel was already closed
    #[error("connection closed")]
    Closed,

    /// Configuration could not be loaded
    #[error("failure to load configs: {0}")]
    ConfigError(String),
}

impl AmqpError {
    pub(crate) fn already_settled(tag: u64) -> Self {
        AmqpError::AckProtocolError(tag, "was already settled".to_owned())
    }

    pub(crate) fn unknown_delivery(tag: u64) -> Self {
        AmqpError::AckProtocolError(tag, "was never delivered on this channel".to_owned())
    }
}

/// Classifies a handler failure for the retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// May succeed on a later attempt; subject to the retry policy.
    Transient,
    /// Will never succeed; the message is dead-lettered immediately.
    Permanent,
}

/// Failure returned by an application handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == HandlerErrorKind::Permanent
    }
}

impl From<HandlerError> for AmqpError {
    fn from(err: HandlerError) -> Self {
        AmqpError::HandlerError(err.message)
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
