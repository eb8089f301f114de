// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End-to-end delivery guarantees against the in-process broker.

mod common;

use common::*;
use futures_util::StreamExt;
use opentelemetry::Context;
use rabbitmq_reliable::{
    configs::Configs,
    consumer::{REASON_DECODE, REASON_EXHAUSTED, REASON_REQUEUE_DISABLED},
    errors::AmqpError,
    events::{EventFilter, EventKind},
    memory::{InMemoryBroker, HEADER_DEATH_QUEUE, HEADER_DEATH_REASON},
    message::{HeaderValue, Message, HEADER_MAX_RETRIES},
    publisher::{PublishOptions, Publisher},
    queue::{QueueBinding, QueueDefinition},
    retry::RetryPolicy,
    topology::Topology,
    transport::Transport,
};
use std::{sync::Arc, time::Duration};

async fn publish(client: &rabbitmq_reliable::client::MessagingClient, id: &str, order_id: u64) {
    client
        .publisher()
        .unwrap()
        .publish(
            &Context::new(),
            EXCHANGE,
            ROUTING_KEY,
            &OrderDeleted { order_id },
            PublishOptions::default().message_id(id),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_messages_are_retried_with_an_incremented_count() {
    let (broker, client) = open().await;
    let repo = OrderRepository::failing(usize::MAX);
    let mut events = client.events().subscribe(EventFilter::any().queue(QUEUE));

    client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(3), repo.clone())
        .spawn()
        .await
        .unwrap();

    publish(&client, "order-1", 1).await;

    let mut seen = events.wait_for(4, WAIT).await.unwrap();
    // A republished attempt may settle before the nack of the attempt before it is reported.
    seen.sort_by_key(|e| e.retry_count);
    let kinds: Vec<EventKind> = seen.iter().map(|e| e.kind).collect();
    let counts: Vec<u32> = seen.iter().map(|e| e.retry_count).collect();

    assert_eq!(
        kinds,
        vec![
            EventKind::Requeue,
            EventKind::Requeue,
            EventKind::Requeue,
            EventKind::Nack
        ]
    );
    assert_eq!(counts, vec![0, 1, 2, 3]);
    assert!(seen.iter().all(|e| e.message_id == "order-1"));
    let mut indexes: Vec<u64> = seen
        .iter()
        .filter(|e| e.kind == EventKind::Requeue)
        .map(|e| e.delivery_index)
        .collect();
    indexes.sort_unstable();
    assert_eq!(indexes, vec![1, 2, 3]);
    assert_eq!(repo.calls(), 4);

    // Only the exhausted attempt is dead-lettered; retried ones were replaced.
    assert_eq!(broker.ready_count(DEAD_QUEUE), 1);
    let dead = broker.get(DEAD_QUEUE).unwrap();
    assert_eq!(dead.id(), "order-1");
    assert_eq!(dead.retry_count(), 3);
    assert_eq!(
        dead.get_header(HEADER_DEATH_REASON),
        Some(&HeaderValue::from("rejected"))
    );
    assert_eq!(
        dead.get_header(HEADER_DEATH_QUEUE),
        Some(&HeaderValue::from(QUEUE))
    );
    assert!(broker.get(DEAD_QUEUE).is_none());

    client.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_messages_are_dead_lettered_with_one_nack() {
    let (broker, client) = open().await;
    let repo = OrderRepository::failing(usize::MAX);
    let mut events = client.events().subscribe(EventFilter::any().queue(QUEUE));

    client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(5), repo.clone())
        .spawn()
        .await
        .unwrap();

    let msg = Message::new("order-2", br#"{"orderId":2}"#.to_vec())
        .with_retry_count(2)
        .header(HEADER_MAX_RETRIES, 2u32);
    client
        .publisher()
        .unwrap()
        .publish_message(EXCHANGE, ROUTING_KEY, &msg)
        .await
        .unwrap();

    let nack = events.next(WAIT).await.unwrap();
    assert_eq!(nack.kind, EventKind::Nack);
    assert_eq!(nack.message_id, "order-2");
    assert_eq!(nack.reason.as_deref(), Some(REASON_EXHAUSTED));
    assert_eq!(repo.calls(), 1);

    assert!(matches!(
        events.next(Duration::from_millis(200)).await,
        Err(AmqpError::Timeout(_))
    ));
    assert_eq!(broker.ready_count(DEAD_QUEUE), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn malformed_payloads_are_dead_lettered_without_running_the_handler() {
    let (broker, client) = open().await;
    let repo = OrderRepository::new();
    let mut nacks = client
        .events()
        .subscribe(EventFilter::kind(EventKind::Nack).queue(QUEUE));

    client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(10), repo.clone())
        .spawn()
        .await
        .unwrap();

    let msg = Message::new("garbage", b"{\"orderId\":".to_vec()).header(HEADER_MAX_RETRIES, 10u32);
    client
        .publisher()
        .unwrap()
        .publish_message(EXCHANGE, ROUTING_KEY, &msg)
        .await
        .unwrap();

    let nack = nacks.next(WAIT).await.unwrap();
    assert_eq!(nack.message_id, "garbage");
    assert_eq!(nack.retry_count, 0);
    assert_eq!(nack.reason.as_deref(), Some(REASON_DECODE));
    assert_eq!(repo.calls(), 0);
    assert_eq!(broker.get(DEAD_QUEUE).map(|m| m.id().to_owned()), Some("garbage".to_owned()));

    client.close().await.unwrap();
}

#[tokio::test]
async fn one_poisoned_message_does_not_affect_its_batch() {
    let (_broker, client) = open().await;
    let repo = OrderRepository::new();
    let bus = client.events();
    let mut acks = bus.subscribe(EventFilter::kind(EventKind::Ack).queue(QUEUE));
    let mut nacks = bus.subscribe(EventFilter::kind(EventKind::Nack).queue(QUEUE));

    client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(3), repo.clone())
        .spawn()
        .await
        .unwrap();

    let publisher = client.publisher().unwrap();
    for order_id in 1..=2 {
        publish(&client, &format!("order-{}", order_id), order_id).await;
    }
    publisher
        .publish_message(
            EXCHANGE,
            ROUTING_KEY,
            &Message::new("poison", b"not json at all".to_vec()),
        )
        .await
        .unwrap();
    for order_id in 3..=4 {
        publish(&client, &format!("order-{}", order_id), order_id).await;
    }

    let acked = acks.wait_for(4, WAIT).await.unwrap();
    let nacked = nacks.wait_for(1, WAIT).await.unwrap();

    assert_eq!(nacked[0].message_id, "poison");
    assert!(acked.iter().all(|e| e.message_id != "poison"));
    assert_eq!(
        acked.iter().map(|e| e.delivery_index).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(bus.count(&EventFilter::kind(EventKind::Nack).queue(QUEUE)), 1);
    assert_eq!(bus.count(&EventFilter::kind(EventKind::Ack).queue(QUEUE)), 4);
    assert!((1..=4).all(|id| repo.is_deleted(id)));

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn expired_messages_reach_the_dead_letter_queue_once() {
    let (broker, client) = open().await;

    client
        .topology()
        .unwrap()
        .queue(QueueDefinition::new("orders.delayed").ttl(2000).dead_letter_exchange(DLX))
        .queue_binding(
            QueueBinding::new("orders.delayed")
                .exchange(EXCHANGE)
                .routing_key("delayed.#"),
        )
        .install()
        .await
        .unwrap();

    client
        .publisher()
        .unwrap()
        .publish(
            &Context::new(),
            EXCHANGE,
            "delayed.order",
            &OrderDeleted { order_id: 9 },
            PublishOptions::default().message_id("late"),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert_eq!(broker.ready_count(DEAD_QUEUE), 0);
    assert_eq!(broker.ready_count("orders.delayed"), 1);

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(broker.ready_count("orders.delayed"), 0);
    assert_eq!(broker.ready_count(DEAD_QUEUE), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.ready_count(DEAD_QUEUE), 1);

    let dead = broker.get(DEAD_QUEUE).unwrap();
    assert_eq!(dead.id(), "late");
    assert_eq!(
        dead.get_header(HEADER_DEATH_REASON),
        Some(&HeaderValue::from("expired"))
    );

    client.close().await.unwrap();
}

#[tokio::test]
async fn a_single_transient_failure_is_absorbed_by_one_retry() {
    let (broker, client) = open().await;
    let repo = OrderRepository::failing(1);
    let bus = client.events();
    let mut acks = bus.subscribe(EventFilter::kind(EventKind::Ack).queue(QUEUE));

    client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(1), repo.clone())
        .spawn()
        .await
        .unwrap();

    publish(&client, "order-42", 42).await;

    let ack = acks.next(WAIT).await.unwrap();
    assert_eq!(ack.message_id, "order-42");
    assert_eq!(ack.retry_count, 1);

    assert_eq!(bus.count(&EventFilter::kind(EventKind::Ack)), 1);
    assert_eq!(bus.count(&EventFilter::kind(EventKind::Requeue)), 1);
    assert_eq!(bus.count(&EventFilter::kind(EventKind::Nack)), 0);
    assert_eq!(repo.calls(), 2);
    assert_eq!(repo.deletions(), 1);
    assert!(repo.is_deleted(42));
    assert_eq!(broker.ready_count(DEAD_QUEUE), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn failed_republish_keeps_the_message() {
    let (broker, client) = open().await;
    let bus = client.events();
    let mut acks = bus.subscribe(EventFilter::kind(EventKind::Ack));

    let outage = Arc::new(Outage {
        broker: broker.clone(),
        calls: std::sync::Mutex::new(vec![]),
    });

    client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(3), outage.clone())
        .spawn()
        .await
        .unwrap();

    publish(&client, "order-7", 7).await;

    let ack = acks.next(WAIT).await.unwrap();
    assert_eq!(ack.message_id, "order-7");
    assert_eq!(*outage.calls.lock().unwrap(), vec![(0, false), (0, true)]);
    assert_eq!(bus.count(&EventFilter::kind(EventKind::Requeue)), 0);

    client.close().await.unwrap();
}

/// Fails its first call while taking the broker down, succeeds once it is back.
struct Outage {
    broker: InMemoryBroker,
    calls: std::sync::Mutex<Vec<(u32, bool)>>,
}

#[async_trait::async_trait]
impl rabbitmq_reliable::consumer::ConsumerHandler for Outage {
    type Payload = OrderDeleted;

    async fn exec(
        &self,
        _ctx: &Context,
        msg: &rabbitmq_reliable::consumer::ConsumerMessage<OrderDeleted>,
    ) -> Result<(), rabbitmq_reliable::errors::HandlerError> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((msg.retry_count, msg.redelivered));
            calls.len() == 1
        };

        self.broker.set_available(!first);
        if first {
            return Err(rabbitmq_reliable::errors::HandlerError::transient(
                "order store unavailable",
            ));
        }
        Ok(())
    }
}

#[tokio::test]
async fn settling_a_delivery_twice_fails_loudly() {
    let broker = InMemoryBroker::new();
    let channel = broker.channel();
    channel.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
    channel
        .send("", "jobs", &Message::new("job-1", b"{}".to_vec()))
        .await
        .unwrap();

    let mut deliveries = channel.consume("jobs", "jobs-consumer").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    let tag = delivery.delivery_tag;

    channel.ack(tag).await.unwrap();

    assert!(matches!(
        channel.ack(tag).await,
        Err(AmqpError::AckProtocolError(t, _)) if t == tag
    ));
    assert!(matches!(
        channel.nack(tag, false).await,
        Err(AmqpError::AckProtocolError(t, _)) if t == tag
    ));
    assert!(matches!(
        channel.ack(tag + 100).await,
        Err(AmqpError::AckProtocolError(_, _))
    ));
}

#[tokio::test]
async fn close_waits_for_in_flight_messages() {
    let (_broker, client) = open().await;
    let gate = Arc::new(Gate::default());
    let bus = client.events();

    let handles = client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(3), gate.clone())
        .spawn()
        .await
        .unwrap();

    publish(&client, "order-5", 5).await;
    gate.started.notified().await;

    let client = Arc::new(client);
    let closing = tokio::spawn({
        let client = client.clone();
        async move { client.close().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!closing.is_finished());
    assert!(client.is_closed());
    assert_eq!(bus.count(&EventFilter::kind(EventKind::Ack)), 0);

    gate.release.notify_one();
    assert_eq!(closing.await.unwrap(), Ok(()));

    assert!(handles[0].is_finished());
    assert_eq!(bus.count(&EventFilter::kind(EventKind::Ack)), 1);
    assert_eq!(client.close().await, Ok(()));
}

#[tokio::test]
async fn close_gives_up_on_handlers_that_never_return() {
    let mut cfg = Configs::default();
    cfg.rabbitmq.drain_timeout_ms = 100;
    let (broker, client) = open_with(cfg).await;
    let gate = Arc::new(Gate::default());

    client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(3), gate.clone())
        .spawn()
        .await
        .unwrap();

    publish(&client, "order-6", 6).await;
    gate.started.notified().await;

    let closed = tokio::time::timeout(Duration::from_secs(3), client.close())
        .await
        .expect("close must not wait for a stuck handler");
    assert_eq!(closed, Err(AmqpError::CloseError(1)));
    assert!(client.is_closed());
    assert_eq!(broker.ready_count(QUEUE), 1);
    assert_eq!(client.close().await, Ok(()));
}

#[tokio::test]
async fn failures_are_dead_lettered_when_requeue_is_disabled() {
    let (broker, client) = open().await;
    let repo = OrderRepository::failing(1);
    let mut nacks = client
        .events()
        .subscribe(EventFilter::kind(EventKind::Nack).queue(QUEUE));

    client
        .dispatcher()
        .await
        .unwrap()
        .register(
            &orders_queue(),
            RetryPolicy::new(3).requeue_on_failure(false),
            repo.clone(),
        )
        .spawn()
        .await
        .unwrap();

    publish(&client, "order-8", 8).await;

    let nack = nacks.next(WAIT).await.unwrap();
    assert_eq!(nack.message_id, "order-8");
    assert_eq!(nack.reason.as_deref(), Some(REASON_REQUEUE_DISABLED));
    assert_eq!(repo.calls(), 1);
    assert_eq!(client.events().count(&EventFilter::kind(EventKind::Requeue)), 0);

    let dead = broker.get(DEAD_QUEUE).unwrap();
    assert_eq!(dead.id(), "order-8");
    assert_eq!(dead.retry_count(), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn cancelled_subscriptions_stop_receiving() {
    let (broker, client) = open().await;
    let repo = OrderRepository::new();
    let mut acks = client.events().subscribe(EventFilter::kind(EventKind::Ack));

    let handles = client
        .dispatcher()
        .await
        .unwrap()
        .register(&orders_queue(), RetryPolicy::new(3), repo.clone())
        .spawn()
        .await
        .unwrap();

    publish(&client, "order-1", 1).await;
    acks.next(WAIT).await.unwrap();

    handles[0].cancel().await;
    assert!(handles[0].is_finished());

    publish(&client, "order-2", 2).await;
    assert_eq!(broker.ready_count(QUEUE), 1);
    assert_eq!(repo.calls(), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn closing_with_unsettled_deliveries_reports_them() {
    let broker = InMemoryBroker::new();
    let channel = broker.channel();
    channel.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
    channel
        .send("", "jobs", &Message::new("job-1", b"{}".to_vec()))
        .await
        .unwrap();

    let mut deliveries = channel.consume("jobs", "jobs-consumer").await.unwrap();
    deliveries.next().await.unwrap().unwrap();

    assert_eq!(
        channel.close(Duration::from_millis(50)).await,
        Err(AmqpError::CloseError(1))
    );
    assert_eq!(broker.ready_count("jobs"), 1);
    assert_eq!(channel.close(Duration::from_millis(50)).await, Ok(()));
}

#[tokio::test]
async fn topology_install_is_idempotent() {
    let (broker, client) = open().await;

    orders_topology(&client).install().await.unwrap();
    assert!(broker.has_queue(QUEUE));
    assert!(broker.has_queue(DEAD_QUEUE));

    let res = client
        .topology()
        .unwrap()
        .queue(QueueDefinition::new(QUEUE).ttl(10))
        .install()
        .await;
    assert_eq!(res, Err(AmqpError::DeclareQueueError(QUEUE.to_owned())));

    let res = client
        .topology()
        .unwrap()
        .queue(QueueDefinition::new("payments").dead_letter_exchange("payments.dlx"))
        .install()
        .await;
    assert_eq!(
        res,
        Err(AmqpError::MissingDeadLetterExchange(
            "payments".to_owned(),
            "payments.dlx".to_owned()
        ))
    );
    assert!(!broker.has_queue("payments"));

    client
        .topology()
        .unwrap()
        .queue(QueueDefinition::new("refunds").dead_letter_exchange(DLX))
        .install()
        .await
        .unwrap();
    assert!(broker.has_queue("refunds"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn publish_failures_surface_to_the_caller() {
    let (broker, client) = open().await;
    let publisher = client.publisher().unwrap();

    let res = publisher
        .publish(
            &Context::new(),
            "missing",
            ROUTING_KEY,
            &OrderDeleted { order_id: 1 },
            PublishOptions::default(),
        )
        .await;
    assert!(matches!(res, Err(AmqpError::PublishingError(_))));

    broker.set_available(false);
    let res = publisher
        .publish(
            &Context::new(),
            EXCHANGE,
            ROUTING_KEY,
            &OrderDeleted { order_id: 1 },
            PublishOptions::default(),
        )
        .await;
    assert!(matches!(res, Err(AmqpError::PublishingError(_))));
    assert_eq!(broker.ready_count(QUEUE), 0);

    client.close().await.unwrap();
}
