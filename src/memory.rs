// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A single-process broker that follows the RabbitMQ semantics the client
//! depends on, so the full publish → consume → retry → dead-letter pipeline
//! can run without a server:
//! - default, direct, fanout and topic routing (`*` matches one word, `#` zero or more)
//! - round-robin delivery to consumers, honouring per-channel prefetch
//! - channel-scoped delivery tags and exactly-once settlement
//! - broker requeue, and dead-lettering on reject-without-requeue or TTL expiry
//! - redeclaration with different settings fails like a `PRECONDITION_FAILED`
//!
//! Dead-lettered messages carry `x-first-death-reason` (`rejected` or
//! `expired`), `x-first-death-queue` and `x-first-death-exchange` headers.
//! Headers exchanges route like fanout exchanges.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{HeaderValue, Message},
    queue::{QueueBinding, QueueDefinition},
    settlement::Settlements,
    transport::{Delivery, DeliveryStream, Transport},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};

pub const HEADER_DEATH_REASON: &str = "x-first-death-reason";
pub const HEADER_DEATH_QUEUE: &str = "x-first-death-queue";
pub const HEADER_DEATH_EXCHANGE: &str = "x-first-death-exchange";

const REASON_REJECTED: &str = "rejected";
const REASON_EXPIRED: &str = "expired";

/// Returns whether a topic binding `pattern` matches `routing_key`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            words_match(&pattern[1..], key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => words_match(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => words_match(&pattern[1..], &key[1..]),
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct Envelope {
    seq: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    /// Set when the queue has a TTL; kept across requeues.
    expires_at: Option<Instant>,
    message: Message,
}

struct Unacked {
    queue: String,
    envelope: Envelope,
}

struct ChannelShared {
    next_tag: AtomicU64,
    prefetch: AtomicU64,
    unacked: Mutex<HashMap<u64, Unacked>>,
    settlements: Settlements,
}

impl ChannelShared {
    fn has_capacity(&self) -> bool {
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        prefetch == 0 || (lock(&self.unacked).len() as u64) < prefetch
    }

    fn take_unacked(&self, delivery_tag: u64) -> Option<Unacked> {
        lock(&self.unacked).remove(&delivery_tag)
    }
}

struct ConsumerSlot {
    tag: String,
    channel: Arc<ChannelShared>,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct BrokerState {
    me: Weak<Mutex<BrokerState>>,
    available: bool,
    next_seq: u64,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError(format!(
                "no exchange `{}`",
                exchange
            )));
        };

        let mut queues: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match def.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };

            if matched && !queues.contains(&binding.queue_name) {
                queues.push(binding.queue_name.clone());
            }
        }

        Ok(queues)
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, message: Message) -> Result<(), AmqpError> {
        let queues = self.route(exchange, routing_key)?;
        if queues.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }

        for queue in queues {
            self.enqueue(&queue, exchange, routing_key, message.clone());
        }

        Ok(())
    }

    fn enqueue(&mut self, queue: &str, exchange: &str, routing_key: &str, message: Message) {
        self.next_seq += 1;
        let seq = self.next_seq;

        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        let ttl = q.def.ttl;
        q.ready.push_back(Envelope {
            seq,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            expires_at: ttl.map(|ttl| Instant::now() + Duration::from_millis(u64::from(ttl))),
            message,
        });

        if let Some(ttl) = ttl {
            self.schedule_expiry(queue.to_owned(), seq, ttl);
        }

        self.dispatch(queue);
    }

    /// Puts a delivery back at the head of its queue. The message keeps its
    /// original expiry: one that expired while delivered is dead-lettered now.
    fn requeue(&mut self, queue: &str, mut envelope: Envelope) {
        envelope.redelivered = true;

        if envelope.expires_at.is_some_and(|at| at <= Instant::now()) {
            debug!(queue, message_id = envelope.message.id(), "requeued message already expired");
            self.dead_letter(queue, envelope, REASON_EXPIRED);
            return;
        }

        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        q.ready.push_front(envelope);

        self.dispatch(queue);
    }

    fn schedule_expiry(&self, queue: String, seq: u64, ttl: u32) {
        let state = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(ttl))).await;
            if let Some(state) = state.upgrade() {
                lock(&state).expire(&queue, seq);
            }
        });
    }

    fn expire(&mut self, queue: &str, seq: u64) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        let Some(pos) = q.ready.iter().position(|e| e.seq == seq) else {
            return;
        };

        if let Some(envelope) = q.ready.remove(pos) {
            debug!(queue, message_id = envelope.message.id(), "message expired");
            self.dead_letter(queue, envelope, REASON_EXPIRED);
        }
    }

    fn dead_letter(&mut self, queue: &str, envelope: Envelope, reason: &str) {
        let Some(def) = self.queues.get(queue).map(|q| q.def.clone()) else {
            return;
        };

        let Some(dlx) = def.dead_letter_exchange.clone() else {
            debug!(queue, "no dead letter exchange, message discarded");
            return;
        };

        let routing_key = def
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| envelope.routing_key.clone());

        let mut message = envelope.message;
        if message.get_header(HEADER_DEATH_REASON).is_none() {
            message = message
                .header(HEADER_DEATH_REASON, reason)
                .header(HEADER_DEATH_QUEUE, queue)
                .header(HEADER_DEATH_EXCHANGE, HeaderValue::from(envelope.exchange));
        }

        match self.route(&dlx, &routing_key) {
            Ok(queues) => {
                for target in queues {
                    self.enqueue(&target, &dlx, &routing_key, message.clone());
                }
            }
            Err(err) => warn!(error = err.to_string(), queue, "dead letter dropped"),
        }
    }

    fn dispatch(&mut self, queue: &str) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        q.consumers.retain(|c| !c.sender.is_closed());

        while !q.ready.is_empty() && !q.consumers.is_empty() {
            let count = q.consumers.len();
            let Some(idx) = (0..count)
                .map(|i| (q.next_consumer + i) % count)
                .find(|&i| q.consumers[i].channel.has_capacity())
            else {
                break;
            };
            q.next_consumer = (idx + 1) % count;

            let Some(envelope) = q.ready.pop_front() else {
                break;
            };

            let consumer = &q.consumers[idx];
            let tag = consumer.channel.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: envelope.exchange.clone(),
                routing_key: envelope.routing_key.clone(),
                redelivered: envelope.redelivered,
                message: envelope.message.clone(),
            };

            lock(&consumer.channel.unacked).insert(
                tag,
                Unacked {
                    queue: queue.to_owned(),
                    envelope,
                },
            );
            consumer.channel.settlements.track(tag);

            if consumer.sender.send(delivery).is_err() {
                let channel = consumer.channel.clone();
                let _ = channel.settlements.settle(tag);
                if let Some(unacked) = channel.take_unacked(tag) {
                    q.ready.push_front(unacked.envelope);
                }
                q.consumers.remove(idx);
                q.next_consumer = 0;
            }
        }
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        InMemoryBroker::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::new_cyclic(|me| {
                Mutex::new(BrokerState {
                    me: me.clone(),
                    available: true,
                    next_seq: 0,
                    exchanges: HashMap::new(),
                    queues: HashMap::new(),
                    bindings: vec![],
                })
            }),
        }
    }

    /// Opens a new channel on this broker.
    pub fn channel(&self) -> InMemoryChannel {
        InMemoryChannel {
            broker: self.clone(),
            shared: Arc::new(ChannelShared {
                next_tag: AtomicU64::new(0),
                prefetch: AtomicU64::new(0),
                unacked: Mutex::new(HashMap::new()),
                settlements: Settlements::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Makes every publish fail while `false`, simulating a broker outage.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    /// Messages waiting in `queue` that no consumer holds.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Removes and returns the head of `queue`, like an auto-acked `basic.get`.
    pub fn get(&self, queue: &str) -> Option<Message> {
        lock(&self.state)
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
            .map(|e| e.message)
    }
}

/// A channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    shared: Arc<ChannelShared>,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Closed);
        }
        Ok(())
    }

    fn settle(&self, delivery_tag: u64) -> Result<Unacked, AmqpError> {
        self.shared.settlements.settle(delivery_tag)?;
        self.shared
            .take_unacked(delivery_tag)
            .ok_or_else(|| AmqpError::unknown_delivery(delivery_tag))
    }

    /// Hands every unacked delivery of this channel back to its queue.
    fn requeue_unacked(&self) {
        let unacked: Vec<(u64, Unacked)> = lock(&self.shared.unacked).drain().collect();
        if unacked.is_empty() {
            return;
        }

        let mut state = lock(&self.broker.state);
        for (tag, entry) in unacked {
            let _ = self.shared.settlements.settle(tag);
            state.requeue(&entry.queue, entry.envelope);
        }
    }
}

#[async_trait]
impl Transport for InMemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        match state.exchanges.get(&def.name) {
            Some(_) if def.passive => Ok(()),
            Some(existing) if existing.kind != def.kind || existing.durable != def.durable => {
                warn!(name = def.name.as_str(), "exchange redeclared with different settings");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        match state.queues.get(&def.name) {
            Some(_) if def.passive => Ok(()),
            Some(existing)
                if existing.def.arguments() != def.arguments()
                    || existing.def.durable != def.durable =>
            {
                warn!(name = def.name.as_str(), "queue redeclared with different arguments");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(AmqpError::DeclareQueueError(def.name.clone())),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        Ok(())
    }

    async fn send(&self, exchange: &str, routing_key: &str, msg: &Message) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);

        if !state.available {
            return Err(AmqpError::PublishingError("broker unavailable".to_owned()));
        }

        state.publish(exchange, routing_key, msg.clone())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let entry = self.settle(delivery_tag)?;
        lock(&self.broker.state).dispatch(&entry.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let entry = self.settle(delivery_tag)?;
        let mut state = lock(&self.broker.state);

        if requeue {
            state.requeue(&entry.queue, entry.envelope);
        } else {
            state.dead_letter(&entry.queue, entry.envelope, REASON_REJECTED);
            state.dispatch(&entry.queue);
        }

        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.shared
            .prefetch
            .store(u64::from(prefetch), Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut state = lock(&self.broker.state);
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };

            q.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_owned(),
                channel: self.shared.clone(),
                sender,
            });
            state.dispatch(queue);
        }

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });

        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = lock(&self.broker.state);
        for q in state.queues.values_mut() {
            q.consumers
                .retain(|c| !(c.tag == consumer_tag && Arc::ptr_eq(&c.channel, &self.shared)));
            q.next_consumer = 0;
        }
        Ok(())
    }

    fn pending_settlements(&self) -> usize {
        self.shared.settlements.pending()
    }

    async fn close(&self, drain_timeout: Duration) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = self.shared.settlements.drained(drain_timeout).await;

        {
            let mut state = lock(&self.broker.state);
            for q in state.queues.values_mut() {
                q.consumers.retain(|c| !Arc::ptr_eq(&c.channel, &self.shared));
                q.next_consumer = 0;
            }
        }
        self.requeue_unacked();

        drained
    }
}
