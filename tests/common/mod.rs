// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Shared fixtures: an in-process broker with an `orders` queue dead-lettering
//! into `orders.dead`, and handlers standing in for the order repository.

#![allow(dead_code)]

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_reliable::{
    client::MessagingClient,
    configs::Configs,
    consumer::{ConsumerHandler, ConsumerMessage},
    errors::HandlerError,
    exchange::ExchangeDefinition,
    memory::InMemoryBroker,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::Notify;

pub const EXCHANGE: &str = "events";
pub const DLX: &str = "events.dlx";
pub const QUEUE: &str = "orders";
pub const DEAD_QUEUE: &str = "orders.dead";
pub const ROUTING_KEY: &str = "order.deleted";

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderDeleted {
    #[serde(rename = "orderId")]
    pub order_id: u64,
}

pub fn orders_queue() -> QueueDefinition {
    QueueDefinition::new(QUEUE).dead_letter_exchange(DLX)
}

pub fn orders_topology(client: &MessagingClient) -> AmqpTopology {
    client
        .topology()
        .unwrap()
        .exchange(ExchangeDefinition::new(EXCHANGE))
        .exchange(ExchangeDefinition::new(DLX).fanout())
        .queue(QueueDefinition::new(DEAD_QUEUE))
        .queue(orders_queue())
        .queue_binding(QueueBinding::new(QUEUE).exchange(EXCHANGE).routing_key("order.*"))
        .queue_binding(QueueBinding::new(DEAD_QUEUE).exchange(DLX).routing_key("#"))
}

/// A client on a fresh broker with the orders topology installed.
pub async fn open() -> (InMemoryBroker, MessagingClient) {
    open_with(Configs::default()).await
}

pub async fn open_with(cfg: Configs) -> (InMemoryBroker, MessagingClient) {
    let broker = InMemoryBroker::new();
    let client = MessagingClient::with_source(cfg, Arc::new(broker.clone()))
        .await
        .unwrap();

    orders_topology(&client).install().await.unwrap();

    (broker, client)
}

/// Deletes orders, failing the first `failures` calls with a transient error.
/// Deleting an order twice has no further effect.
#[derive(Default)]
pub struct OrderRepository {
    failures: usize,
    calls: AtomicUsize,
    deleted: Mutex<HashSet<u64>>,
    deletions: AtomicUsize,
}

impl OrderRepository {
    pub fn new() -> Arc<OrderRepository> {
        Arc::new(OrderRepository::default())
    }

    pub fn failing(failures: usize) -> Arc<OrderRepository> {
        Arc::new(OrderRepository {
            failures,
            ..OrderRepository::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn deletions(&self) -> usize {
        self.deletions.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self, order_id: u64) -> bool {
        self.deleted.lock().unwrap().contains(&order_id)
    }
}

#[async_trait]
impl ConsumerHandler for OrderRepository {
    type Payload = OrderDeleted;

    async fn exec(
        &self,
        _ctx: &Context,
        msg: &ConsumerMessage<OrderDeleted>,
    ) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(HandlerError::transient("order store unavailable"));
        }

        if self.deleted.lock().unwrap().insert(msg.payload.order_id) {
            self.deletions.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }
}

/// Blocks every message until released.
#[derive(Default)]
pub struct Gate {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl ConsumerHandler for Gate {
    type Payload = OrderDeleted;

    async fn exec(
        &self,
        _ctx: &Context,
        _msg: &ConsumerMessage<OrderDeleted>,
    ) -> Result<(), HandlerError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}
