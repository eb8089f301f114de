// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Core of message consumption. For every delivery the [`RetryEngine`]:
//! 1. Reads the retry count and retry budget from the headers
//! 2. Opens a consumer span parented on the propagated trace context
//! 3. Decodes the JSON payload and runs the registered [`ConsumerHandler`]
//! 4. Settles the delivery exactly once according to its [`RetryPolicy`]
//! 5. Reports the outcome on the lifecycle [`EventBus`]
//!
//! Retrying is done at the application level: the message is republished with
//! `retryCount + 1` and the original delivery is acked, so neither a broker
//! requeue nor the dead-letter exchange sees it again. The two steps are not
//! atomic, so a crash in between may produce a duplicate but never loses the
//! message.

use crate::{
    errors::{AmqpError, HandlerError},
    events::{EventBus, EventDetails, EventKind},
    message::{HeaderValue, Message},
    otel,
    retry::{DeliveryOutcome, ProcessingResult, RepublishRoute, RetryPolicy},
    transport::{with_timeout, Delivery, Transport},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Reason attached to the nack event of an undecodable payload.
pub const REASON_DECODE: &str = "decode";
/// Reason attached when the handler reported a permanent failure.
pub const REASON_PERMANENT: &str = "permanent";
pub const REASON_EXHAUSTED: &str = "retries exhausted";
pub const REASON_REQUEUE_DISABLED: &str = "requeue disabled";

/// A decoded delivery as seen by application handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage<T> {
    pub queue: String,
    pub message_id: String,
    pub msg_type: Option<String>,
    /// Number of application-level retries already attempted.
    pub retry_count: u32,
    pub max_retries: u32,
    pub redelivered: bool,
    pub payload: T,
    pub headers: BTreeMap<String, HeaderValue>,
}

/// Application handler contract.
///
/// Returning a transient [`HandlerError`] lets the retry policy decide whether
/// the message is tried again; a permanent one dead-letters it right away.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    type Payload: DeserializeOwned + Send + Sync;

    async fn exec(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage<Self::Payload>,
    ) -> Result<(), HandlerError>;
}

/// Type-erased decode-and-handle step so engines of different payload types
/// can live side by side.
#[async_trait]
pub(crate) trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        ctx: &Context,
        queue: &str,
        delivery: &Delivery,
        max_retries: u32,
    ) -> ProcessingResult;
}

pub(crate) struct TypedProcessor<H> {
    handler: Arc<H>,
}

#[async_trait]
impl<H> MessageProcessor for TypedProcessor<H>
where
    H: ConsumerHandler + 'static,
{
    async fn process(
        &self,
        ctx: &Context,
        queue: &str,
        delivery: &Delivery,
        max_retries: u32,
    ) -> ProcessingResult {
        let msg = &delivery.message;

        let payload = match serde_json::from_slice::<H::Payload>(msg.payload()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue,
                    message_id = msg.id(),
                    "failure to decode payload"
                );
                return ProcessingResult::Undecodable(err.to_string());
            }
        };

        let consumer_msg = ConsumerMessage {
            queue: queue.to_owned(),
            message_id: msg.id().to_owned(),
            msg_type: msg.get_kind().map(str::to_owned),
            retry_count: msg.retry_count(),
            max_retries,
            redelivered: delivery.redelivered,
            payload,
            headers: msg.header_map().clone(),
        };

        match self.handler.exec(ctx, &consumer_msg).await {
            Ok(()) => ProcessingResult::Handled,
            Err(err) => ProcessingResult::Failed(err),
        }
    }
}

/// Settles the deliveries of one queue.
pub struct RetryEngine {
    queue: String,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    policy: RetryPolicy,
    processor: Arc<dyn MessageProcessor>,
    timeout: Duration,
}

impl RetryEngine {
    /// `timeout` bounds each broker call made while settling a delivery.
    pub fn new<H>(
        queue: &str,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
        policy: RetryPolicy,
        handler: Arc<H>,
        timeout: Duration,
    ) -> RetryEngine
    where
        H: ConsumerHandler + 'static,
    {
        RetryEngine {
            queue: queue.to_owned(),
            transport,
            events,
            policy,
            processor: Arc::new(TypedProcessor { handler }),
            timeout,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Processes and settles one delivery.
    ///
    /// Unrecoverable messages (poisoned, out of retries) are not errors: they
    /// are dead-lettered and reported as a `Nack` event. An `Err` means the
    /// broker could not be told about the outcome.
    pub async fn handle(&self, delivery: Delivery) -> Result<DeliveryOutcome, AmqpError> {
        let msg = &delivery.message;
        let retry_count = msg.retry_count();
        let max_retries = self.policy.max_retries_for(msg);

        let (ctx, mut span) = otel::new_span(msg, &global::tracer("amqp consumer"), &self.queue);

        debug!(
            queue = self.queue.as_str(),
            message_id = msg.id(),
            delivery_tag = delivery.delivery_tag,
            retry_count,
            max_retries,
            "received"
        );

        let result = self
            .processor
            .process(&ctx, &self.queue, &delivery, max_retries)
            .await;

        let outcome = self.policy.decide(&result, retry_count, max_retries);

        let settled = match outcome {
            DeliveryOutcome::Ack => self.ack(&delivery).await,
            DeliveryOutcome::NackRequeue => self.requeue(&delivery, &result).await,
            DeliveryOutcome::NackDiscard => {
                let reason = self.discard_reason(&result, retry_count, max_retries);
                self.discard(&delivery, reason).await
            }
        };

        match (&settled, &result) {
            (Err(err), _) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            (Ok(()), ProcessingResult::Handled) => span.set_status(Status::Ok),
            (Ok(()), ProcessingResult::Failed(err)) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            (Ok(()), ProcessingResult::Undecodable(err)) => span.set_status(Status::Error {
                description: Cow::from(format!("undecodable payload: {}", err)),
            }),
        }

        settled.map(|_| outcome)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        self.settle("ack", delivery, self.transport.ack(delivery.delivery_tag))
            .await?;

        debug!(
            queue = self.queue.as_str(),
            message_id = delivery.message.id(),
            "message successfully processed"
        );
        self.emit(EventKind::Ack, delivery, None);
        Ok(())
    }

    async fn requeue(
        &self,
        delivery: &Delivery,
        result: &ProcessingResult,
    ) -> Result<(), AmqpError> {
        let msg = &delivery.message;
        let next = next_attempt(msg);

        let (exchange, routing_key) = match self.policy.republish {
            RepublishRoute::Original => (delivery.exchange.as_str(), delivery.routing_key.as_str()),
            RepublishRoute::Queue => ("", self.queue.as_str()),
        };

        if let ProcessingResult::Failed(err) = result {
            warn!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                message_id = msg.id(),
                retry_count = next.retry_count(),
                "error whiling handling msg, requeuing for latter"
            );
        }

        let republished = with_timeout(
            self.timeout,
            "republish",
            self.transport.send(exchange, routing_key, &next),
        )
        .await;

        if let Err(err) = republished {
            error!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                message_id = msg.id(),
                "failure to republish, handing the message back to the broker"
            );
            self.settle(
                "nack",
                delivery,
                self.transport.nack(delivery.delivery_tag, true),
            )
            .await?;
            return Err(err);
        }

        // The republished copy replaces this delivery. Rejecting it instead
        // would dead-letter a stale attempt on queues with a DLX.
        self.settle("ack", delivery, self.transport.ack(delivery.delivery_tag))
            .await?;

        self.emit(EventKind::Requeue, delivery, None);
        Ok(())
    }

    async fn discard(&self, delivery: &Delivery, reason: &str) -> Result<(), AmqpError> {
        self.settle(
            "nack",
            delivery,
            self.transport.nack(delivery.delivery_tag, false),
        )
        .await?;

        error!(
            queue = self.queue.as_str(),
            message_id = delivery.message.id(),
            retry_count = delivery.message.retry_count(),
            reason,
            "removing message from queue"
        );
        self.emit(EventKind::Nack, delivery, Some(reason));
        Ok(())
    }

    fn discard_reason(
        &self,
        result: &ProcessingResult,
        retry_count: u32,
        max_retries: u32,
    ) -> &'static str {
        match result {
            ProcessingResult::Undecodable(_) => REASON_DECODE,
            ProcessingResult::Failed(err) if err.is_permanent() => REASON_PERMANENT,
            _ if retry_count >= max_retries => REASON_EXHAUSTED,
            _ => REASON_REQUEUE_DISABLED,
        }
    }

    async fn settle<F>(&self, what: &str, delivery: &Delivery, fut: F) -> Result<(), AmqpError>
    where
        F: Future<Output = Result<(), AmqpError>>,
    {
        with_timeout(self.timeout, what, fut).await.map_err(|err| {
            error!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                delivery_tag = delivery.delivery_tag,
                "error whiling {} msg",
                what
            );
            err
        })
    }

    fn emit(&self, kind: EventKind, delivery: &Delivery, reason: Option<&str>) {
        self.events.emit(
            kind,
            &self.queue,
            EventDetails {
                message_id: delivery.message.id().to_owned(),
                delivery_tag: delivery.delivery_tag,
                retry_count: delivery.message.retry_count(),
                reason: reason.map(str::to_owned),
                headers: delivery.message.header_map().clone(),
            },
        );
    }
}

/// The envelope of the next attempt: same id, payload and headers, `retryCount + 1`.
pub fn next_attempt(msg: &Message) -> Message {
    msg.with_retry_count(msg.retry_count() + 1)
}
