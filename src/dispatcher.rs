// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Consumes registered queues and hands every delivery to the queue's
//! [`RetryEngine`]. Each queue gets its own consumer; messages are processed
//! concurrently, bounded by `consumer.concurrency`, so one slow or poisoned
//! message never holds back its neighbours.
//!
//! A subscription can be cancelled through its [`SubscriptionHandle`]:
//! the broker stops delivering, deliveries still buffered locally are handed
//! back with a requeue, and messages already being processed run to
//! completion before the handle reports the subscription as finished.

use crate::{
    configs::Configs,
    consumer::{ConsumerHandler, RetryEngine},
    errors::AmqpError,
    events::EventBus,
    queue::QueueDefinition,
    retry::RetryPolicy,
    transport::{with_timeout, Delivery, DeliveryStream, Transport},
};
use futures_util::{future::join_all, StreamExt};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Links a queue to the engine processing its deliveries.
#[derive(Clone)]
pub struct RabbitMQDispatcherDefinition {
    pub(crate) queue_def: QueueDefinition,
    pub(crate) engine: Arc<RetryEngine>,
}

/// Handle to a running subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    queue: String,
    consumer_tag: String,
    cancel: Arc<watch::Sender<bool>>,
    finished: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Stops new deliveries and waits until in-flight messages are settled.
    /// Cancelling an already cancelled subscription just waits.
    pub async fn cancel(&self) {
        self.cancel.send_replace(true);
        self.finished().await;
    }

    /// Resolves once the subscription stopped and its in-flight messages settled.
    pub async fn finished(&self) {
        let mut finished = self.finished.clone();
        // An error means the consuming task is gone, which is finished too.
        let _ = finished.wait_for(|done| *done).await;
    }
}

/// Subscriptions started through a client, cancelled together on close.
#[derive(Clone, Default)]
pub(crate) struct Subscriptions {
    handles: Arc<Mutex<Vec<SubscriptionHandle>>>,
}

impl Subscriptions {
    fn push(&self, handle: SubscriptionHandle) {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub(crate) async fn cancel_all(&self) {
        let handles: Vec<SubscriptionHandle> = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();

        join_all(handles.iter().map(|h| h.cancel())).await;
    }
}

/// Runs consumers for registered queues on one channel.
pub struct RabbitMQDispatcher {
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    prefetch: u16,
    concurrency: usize,
    timeout: Duration,
    pub(crate) dispatchers_def: Vec<RabbitMQDispatcherDefinition>,
    subscriptions: Option<Subscriptions>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher consuming through `transport`.
    ///
    /// Prefetch, concurrency and the broker call timeout come from `cfg`.
    pub fn new(transport: Arc<dyn Transport>, events: Arc<EventBus>, cfg: &Configs) -> Self {
        RabbitMQDispatcher {
            transport,
            events,
            prefetch: cfg.rabbitmq.prefetch,
            concurrency: cfg.consumer.concurrency.max(1),
            timeout: cfg.rabbitmq.operation_timeout(),
            dispatchers_def: vec![],
            subscriptions: None,
        }
    }

    pub(crate) fn tracked(mut self, subscriptions: Subscriptions) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// Registers `handler` for the deliveries of `queue_def`.
    pub fn register<H>(mut self, queue_def: &QueueDefinition, policy: RetryPolicy, handler: Arc<H>) -> Self
    where
        H: ConsumerHandler + 'static,
    {
        let engine = RetryEngine::new(
            &queue_def.name,
            self.transport.clone(),
            self.events.clone(),
            policy,
            handler,
            self.timeout,
        );

        self.dispatchers_def.push(RabbitMQDispatcherDefinition {
            queue_def: queue_def.clone(),
            engine: Arc::new(engine),
        });

        self
    }

    /// Starts a consumer per registered queue and returns immediately.
    pub async fn spawn(&self) -> Result<Vec<SubscriptionHandle>, AmqpError> {
        if self.dispatchers_def.is_empty() {
            error!("no handlers registered");
            return Err(AmqpError::ConsumerError("no handlers registered".to_owned()));
        }

        with_timeout(self.timeout, "qos", self.transport.qos(self.prefetch))
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        let mut handles = vec![];
        for def in &self.dispatchers_def {
            let handle = self.subscribe(def).await?;
            if let Some(subscriptions) = &self.subscriptions {
                subscriptions.push(handle.clone());
            }
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Consumes every registered queue until all subscriptions end.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let handles = self.spawn().await?;
        join_all(handles.iter().map(|h| h.finished())).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        def: &RabbitMQDispatcherDefinition,
    ) -> Result<SubscriptionHandle, AmqpError> {
        let queue = def.queue_def.name.clone();
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        let stream = match self.transport.consume(&queue, &consumer_tag).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue.as_str(),
                    "failure to create the consumer"
                );
                return Err(err);
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        let subscription = Subscription {
            consumer_tag: consumer_tag.clone(),
            engine: def.engine.clone(),
            transport: self.transport.clone(),
            permits: Arc::new(Semaphore::new(self.concurrency)),
            timeout: self.timeout,
            _cancel: cancel_tx.clone(),
        };

        tokio::spawn(async move {
            subscription.run(stream, cancel_rx).await;
            finished_tx.send_replace(true);
        });

        debug!(queue = queue.as_str(), consumer_tag = consumer_tag.as_str(), "consumer started");

        Ok(SubscriptionHandle {
            queue,
            consumer_tag,
            cancel: cancel_tx,
            finished: finished_rx,
        })
    }
}

struct Subscription {
    consumer_tag: String,
    engine: Arc<RetryEngine>,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    // Keeps the cancel flag alive while handles come and go.
    _cancel: Arc<watch::Sender<bool>>,
}

impl Subscription {
    async fn run(self, mut stream: DeliveryStream, mut cancel: watch::Receiver<bool>) {
        let queue = self.engine.queue().to_owned();
        let mut inflight = JoinSet::new();
        let mut cancel_permit = cancel.clone();

        loop {
            tokio::select! {
                biased;

                _ = cancelled(&mut cancel) => break,

                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = err.to_string(), queue = queue.as_str(), "tokio process error");
                    }
                }

                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        let permit = tokio::select! {
                            permit = self.permits.clone().acquire_owned() => permit.ok(),
                            _ = cancelled(&mut cancel_permit) => None,
                        };

                        let Some(permit) = permit else {
                            self.hand_back(delivery.delivery_tag).await;
                            break;
                        };

                        let engine = self.engine.clone();
                        inflight.spawn(async move {
                            let _permit = permit;
                            dispatch(&engine, delivery).await;
                        });
                    }
                    Some(Err(err)) => error!(error = err.to_string(), queue = queue.as_str(), "errors consume msg"),
                    None => {
                        debug!(queue = queue.as_str(), "delivery stream ended");
                        break;
                    }
                },
            }
        }

        let stopping = *cancel.borrow();
        if stopping {
            self.stop(&mut stream).await;
        }

        while let Some(joined) = inflight.join_next().await {
            if let Err(err) = joined {
                error!(error = err.to_string(), queue = queue.as_str(), "tokio process error");
            }
        }

        debug!(queue = queue.as_str(), consumer_tag = self.consumer_tag.as_str(), "consumer stopped");
    }

    /// Cancels the broker consumer and returns deliveries that arrived before
    /// the cancel took effect.
    async fn stop(&self, stream: &mut DeliveryStream) {
        if let Err(err) = with_timeout(
            self.timeout,
            "cancel",
            self.transport.cancel(&self.consumer_tag),
        )
        .await
        {
            warn!(error = err.to_string(), consumer_tag = self.consumer_tag.as_str(), "failure to cancel consumer");
        }

        loop {
            match tokio::time::timeout(self.timeout, stream.next()).await {
                Ok(Some(Ok(delivery))) => self.hand_back(delivery.delivery_tag).await,
                Ok(Some(Err(err))) => {
                    warn!(error = err.to_string(), "error draining cancelled consumer")
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn hand_back(&self, delivery_tag: u64) {
        if let Err(err) = self.transport.nack(delivery_tag, true).await {
            error!(error = err.to_string(), delivery_tag, "error whiling requeuing");
        }
    }
}

/// Resolves once the cancel flag is raised, or its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

/// Runs one delivery through its engine.
///
/// A double settlement is a bug in the calling code: debug builds panic on it,
/// release builds log it and keep consuming.
async fn dispatch(engine: &RetryEngine, delivery: Delivery) {
    if let Err(err) = engine.handle(delivery).await {
        error!(error = err.to_string(), queue = engine.queue(), "error consume msg");
        debug_assert!(
            !matches!(err, AmqpError::AckProtocolError(..)),
            "delivery settled twice on queue `{}`: {}",
            engine.queue(),
            err
        );
    }
}
