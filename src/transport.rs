// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The `Transport` trait is the seam between the reliability logic (topology,
//! publisher, retry engine) and a concrete broker channel. Two implementations
//! ship with the crate:
//! - [`crate::channel::AmqpChannel`]: a lapin channel on a live RabbitMQ connection
//! - [`crate::memory::InMemoryChannel`]: an in-process broker for tests and local runs
//!
//! Every implementation must settle each delivery tag at most once and report
//! a second settlement as [`AmqpError::AckProtocolError`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::Stream;
use std::{future::Future, pin::Pin, time::Duration};
use tracing::error;

#[cfg(test)]
use mockall::automock;

/// A message handed to a consumer, tagged for later settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    pub routing_key: String,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    pub message: Message,
}

/// Stream of deliveries for one consumer subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, AmqpError>> + Send>>;

/// Raw broker operations used by the rest of the client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares an exchange. Redeclaring with identical settings is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue with its arguments (TTL, dead lettering, limits).
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message. No retry is attempted on failure.
    async fn send(&self, exchange: &str, routing_key: &str, msg: &Message)
        -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a delivery; `requeue = false` lets the broker dead-letter it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    /// Stops new deliveries for the subscription; in-flight ones stay settleable.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Number of deliveries handed out and not yet acked or nacked.
    fn pending_settlements(&self) -> usize;

    /// Waits for outstanding settlements, then tears the channel down.
    async fn close(&self, drain_timeout: Duration) -> Result<(), AmqpError>;
}

/// Bounds a broker operation, turning an elapsed deadline into [`AmqpError::Timeout`].
pub(crate) async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, AmqpError>
where
    F: Future<Output = Result<T, AmqpError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            error!(operation = what, "operation timed out");
            Err(AmqpError::Timeout(what.to_owned()))
        }
    }
}
