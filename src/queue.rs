// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing queues and their bindings. Dead-letter routing and TTL are
//! expressed as queue arguments and enforced by the broker; the client only
//! declares them.

use crate::message::HeaderValue;
use std::collections::BTreeMap;

/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key of dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for per-queue message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument for the maximum number of ready messages
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Suffix appended to a queue name by [`QueueDefinition::with_dlq`].
pub const DLQ_SUFFIX: &str = "-dlq";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Supports message TTL, max length and dead-letter routing, either to an
/// explicit exchange or to a companion `<name>-dlq` queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Messages left in the queue longer than this are dead-lettered by the broker.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Routes rejected and expired messages to `exchange`.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Overrides the routing key of dead-lettered messages.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    /// Adds a Dead Letter Queue (DLQ) named `<name>-dlq`, fed through the default exchange.
    pub fn with_dlq(mut self) -> Self {
        let dlq_name = format!("{}{}", self.name, DLQ_SUFFIX);
        self.dead_letter_exchange = Some(String::new());
        self.dead_letter_routing_key = Some(dlq_name.clone());
        self.dlq_name = Some(dlq_name);
        self
    }

    pub fn get_dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn get_dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn get_ttl(&self) -> Option<u32> {
        self.ttl
    }

    /// Broker arguments derived from this definition.
    pub fn arguments(&self) -> BTreeMap<String, HeaderValue> {
        let mut args = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::from(exchange.clone()),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::from(key.clone()),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::from(ttl));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::from(max));
        }

        args
    }

    /// Definition of the companion DLQ, inheriting durability from this queue.
    pub(crate) fn dlq_definition(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|name| QueueDefinition {
            name: name.clone(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            ..QueueDefinition::default()
        })
    }
}

/// Configuration for binding a queue to an exchange.
///
/// `routing_key` may be a topic pattern such as `user.*` or `orders.#`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// [`QueueBinding::exchange`] and [`QueueBinding::routing_key`].
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn get_routing_key(&self) -> &str {
        &self.routing_key
    }
}
