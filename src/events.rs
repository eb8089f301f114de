// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Event Bus
//!
//! In-memory, ordered stream of settlement events (ack, nack, requeue) emitted
//! by the retry engine. Observers subscribe with a filter and await a number of
//! matching events with a deadline instead of polling the broker.
//!
//! Subscriptions only observe events emitted after they were created; the
//! bounded [`EventBus::history`] keeps the most recent events for inspection.

use crate::{errors::AmqpError, message::HeaderValue};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::Instant,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The handler succeeded and the delivery was acked.
    Ack,
    /// The delivery was rejected without requeue: poisoned or out of retries.
    Nack,
    /// The message was republished for another attempt.
    Requeue,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Ack => write!(f, "ack"),
            EventKind::Nack => write!(f, "nack"),
            EventKind::Requeue => write!(f, "requeue"),
        }
    }
}

/// Per-message data attached to an emitted event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDetails {
    pub message_id: String,
    pub delivery_tag: u64,
    pub retry_count: u32,
    pub reason: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub queue: String,
    pub message_id: String,
    pub delivery_tag: u64,
    pub retry_count: u32,
    /// 1-based position of this event among events of the same kind on the same queue.
    pub delivery_index: u64,
    pub reason: Option<String>,
    /// Headers of the settled delivery, e.g. `maxRetries` or `x-first-death-*`.
    pub headers: BTreeMap<String, HeaderValue>,
    pub timestamp: DateTime<Utc>,
}

/// Selects events by kind, queue and message id; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kind: Option<EventKind>,
    queue: Option<String>,
    message_id: Option<String>,
}

impl EventFilter {
    pub fn any() -> EventFilter {
        EventFilter::default()
    }

    pub fn kind(kind: EventKind) -> EventFilter {
        EventFilter {
            kind: Some(kind),
            ..EventFilter::default()
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        self.kind.map_or(true, |k| k == event.kind)
            && self.queue.as_ref().map_or(true, |q| *q == event.queue)
            && self
                .message_id
                .as_ref()
                .map_or(true, |id| *id == event.message_id)
    }
}

type Predicate = Arc<dyn Fn(&LifecycleEvent) -> bool + Send + Sync>;

struct BusState {
    counters: HashMap<(String, EventKind), u64>,
    history: VecDeque<LifecycleEvent>,
}

pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    state: Mutex<BusState>,
    history_limit: usize,
}

impl EventBus {
    /// Creates a bus whose subscribers may lag by up to `capacity` events.
    pub fn new(capacity: usize, history_limit: usize) -> EventBus {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus {
            sender,
            state: Mutex::new(BusState {
                counters: HashMap::new(),
                history: VecDeque::new(),
            }),
            history_limit,
        }
    }

    /// Records and broadcasts an event; returns it with its index and timestamp set.
    pub fn emit(&self, kind: EventKind, queue: &str, details: EventDetails) -> LifecycleEvent {
        let mut state = self.lock();

        let counter = state
            .counters
            .entry((queue.to_owned(), kind))
            .or_default();
        *counter += 1;

        let event = LifecycleEvent {
            kind,
            queue: queue.to_owned(),
            message_id: details.message_id,
            delivery_tag: details.delivery_tag,
            retry_count: details.retry_count,
            delivery_index: *counter,
            reason: details.reason,
            headers: details.headers,
            timestamp: Utc::now(),
        };

        if self.history_limit > 0 {
            if state.history.len() == self.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        // Sending under the lock keeps broadcast order identical to index order.
        if self.sender.send(event.clone()).is_err() {
            debug!(kind = %kind, queue, "no lifecycle subscribers");
        }

        event
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.subscribe_where(move |event| filter.matches(event))
    }

    /// Subscribes with an arbitrary predicate.
    pub fn subscribe_where<F>(&self, predicate: F) -> EventSubscription
    where
        F: Fn(&LifecycleEvent) -> bool + Send + Sync + 'static,
    {
        EventSubscription {
            receiver: self.sender.subscribe(),
            predicate: Arc::new(predicate),
        }
    }

    /// Waits for `count` matching events emitted after this call.
    pub async fn wait_for(
        &self,
        filter: EventFilter,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<LifecycleEvent>, AmqpError> {
        self.subscribe(filter).wait_for(count, timeout).await
    }

    pub fn history(&self) -> Vec<LifecycleEvent> {
        self.lock().history.iter().cloned().collect()
    }

    /// Counts retained events matching `filter`.
    pub fn count(&self, filter: &EventFilter) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|e| filter.matches(e))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An ordered, filtered view of the bus.
pub struct EventSubscription {
    receiver: broadcast::Receiver<LifecycleEvent>,
    predicate: Predicate,
}

impl EventSubscription {
    /// Next matching event, or [`AmqpError::Timeout`] after `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> Result<LifecycleEvent, AmqpError> {
        self.next_before(Instant::now() + timeout).await
    }

    /// Collects `count` matching events; the deadline covers all of them.
    pub async fn wait_for(
        &mut self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<LifecycleEvent>, AmqpError> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::with_capacity(count);

        while events.len() < count {
            match self.next_before(deadline).await {
                Ok(event) => events.push(event),
                Err(AmqpError::Timeout(_)) => {
                    return Err(AmqpError::Timeout(format!(
                        "{} lifecycle events, got {}",
                        count,
                        events.len()
                    )))
                }
                Err(err) => return Err(err),
            }
        }

        Ok(events)
    }

    /// Turns the subscription into a stream that ends when the bus is dropped.
    pub fn into_stream(self) -> impl Stream<Item = LifecycleEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            loop {
                match sub.receiver.recv().await {
                    Ok(event) if (sub.predicate)(&event) => return Some((event, sub)),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "lifecycle subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    async fn next_before(&mut self, deadline: Instant) -> Result<LifecycleEvent, AmqpError> {
        loop {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Err(_) => return Err(AmqpError::Timeout("lifecycle event".to_owned())),
                Ok(Ok(event)) if (self.predicate)(&event) => return Ok(event),
                Ok(Ok(_)) => continue,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "lifecycle subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) => return Err(AmqpError::Closed),
            }
        }
    }
}
