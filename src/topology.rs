// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them, with dead-letter
//! routing and queue TTL declared as queue arguments.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over any [`Transport`]
//!
//! Installation is idempotent: declaring the same topology twice leaves the broker unchanged.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{with_timeout, Transport},
};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{debug, error};

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// Exchanges are declared before queues, so dead letter exchanges exist
    /// before any queue references them.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Implementation of the Topology trait over a [`Transport`].
pub struct AmqpTopology {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    /// Creates a new topology whose declarations are each bounded by `timeout`.
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> AmqpTopology {
        AmqpTopology {
            transport,
            timeout,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.retain(|e| e.name != def.name);
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Validates dead letter references
    /// 2. Creates all exchanges
    /// 3. Creates all queues (each DLQ before the queue feeding it)
    /// 4. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        self.validate().await?;

        for exch in &self.exchanges {
            self.declare_exchange(exch).await?;
        }

        for def in &self.queues {
            if let Some(dlq) = def.dlq_definition() {
                self.declare_queue(&dlq).await?;
            }
            self.declare_queue(def).await?;
        }

        for binding in &self.queues_binding {
            self.bind(binding).await?;
        }

        debug!("topology installed");
        Ok(())
    }
}

impl AmqpTopology {
    /// Checks that every dead letter exchange a queue refers to exists.
    ///
    /// Exchanges of this topology count as existing. Any other one must already
    /// be on the broker, which is checked with a passive declaration. The
    /// default exchange (`""`) always exists. On RabbitMQ a failed passive
    /// declaration closes the channel it was made on.
    pub async fn validate(&self) -> Result<(), AmqpError> {
        let exchanges: HashSet<&str> = self.exchanges.iter().map(|e| e.name.as_str()).collect();
        let mut checked: HashSet<&str> = HashSet::new();

        for def in &self.queues {
            let Some(dlx) = def.get_dead_letter_exchange() else {
                continue;
            };
            if dlx.is_empty() || exchanges.contains(dlx) || checked.contains(dlx) {
                continue;
            }

            let existing = ExchangeDefinition::new(dlx).passive();
            if let Err(err) = self.declare_exchange(&existing).await {
                error!(
                    error = err.to_string(),
                    queue = def.name.as_str(),
                    exchange = dlx,
                    "dead letter exchange is not declared"
                );
                return Err(AmqpError::MissingDeadLetterExchange(
                    def.name.clone(),
                    dlx.to_owned(),
                ));
            }
            checked.insert(dlx);
        }

        Ok(())
    }

    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);
        with_timeout(
            self.timeout,
            "exchange declaration",
            self.transport.declare_exchange(def),
        )
        .await?;
        debug!("exchange: {} was created", def.name);
        Ok(())
    }

    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);
        with_timeout(
            self.timeout,
            "queue declaration",
            self.transport.declare_queue(def),
        )
        .await?;
        debug!("queue: {} was created", def.name);
        Ok(())
    }

    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        with_timeout(
            self.timeout,
            "queue binding",
            self.transport.bind_queue(binding),
        )
        .await
    }
}
