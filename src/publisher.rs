// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Serializes application events to JSON envelopes, stamps correlation
//! metadata (message id, retry count) and the caller's trace context, and
//! sends them with a single bounded write. There is no retry at this layer:
//! retry is a consumer-side concept.
//!
//! A `maxRetries` header is only written when the caller overrides the retry
//! budget; otherwise the consuming side's policy applies.

use crate::{
    errors::AmqpError,
    message::{HeaderValue, Message, HEADER_MAX_RETRIES, HEADER_MESSAGE_ID, HEADER_RETRY_COUNT},
    otel,
    transport::{with_timeout, Transport},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Headers only the client stamps; `maxRetries` goes through [`PublishOptions::max_retries`].
const RESERVED_HEADERS: &[&str] = &[HEADER_MESSAGE_ID, HEADER_RETRY_COUNT, HEADER_MAX_RETRIES];

/// Per-publish settings. Unset fields fall back to generated or configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub message_id: Option<String>,
    pub max_retries: Option<u32>,
    pub message_type: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl PublishOptions {
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Serializes `payload` as JSON and publishes it; returns the message id.
    async fn publish<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String, AmqpError>
    where
        T: Serialize + Sync + ?Sized;

    /// Publishes a prebuilt envelope unchanged.
    async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &Message,
    ) -> Result<(), AmqpError>;
}

/// Publisher sending through a [`Transport`].
pub struct RabbitMQPublisher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RabbitMQPublisher {
    /// Creates a publisher whose sends are each bounded by `timeout`.
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { transport, timeout })
    }

    /// Builds the envelope `publish` would send.
    pub fn envelope<T>(
        &self,
        ctx: &Context,
        payload: &T,
        options: PublishOptions,
    ) -> Result<Message, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::PublishingError(err.to_string())
        })?;

        let msg = match options.message_id {
            Some(id) => Message::new(id, data),
            None => Message::with_generated_id(data),
        };

        let mut extra = options.headers;
        for reserved in RESERVED_HEADERS {
            if extra.remove(*reserved).is_some() {
                warn!(header = *reserved, "ignoring reserved header set by the caller");
            }
        }

        let mut msg = msg.headers(otel::inject(ctx)).headers(extra);

        if let Some(max) = options.max_retries {
            msg = msg.header(HEADER_MAX_RETRIES, max);
        }

        if let Some(kind) = options.message_type {
            msg = msg.kind(kind);
        }

        Ok(msg)
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<String, AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let msg = self.envelope(ctx, payload, options)?;
        self.publish_message(exchange, routing_key, &msg).await?;
        Ok(msg.id().to_owned())
    }

    async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &Message,
    ) -> Result<(), AmqpError> {
        with_timeout(
            self.timeout,
            "publish",
            self.transport.send(exchange, routing_key, msg),
        )
        .await?;

        debug!(
            exchange,
            routing_key,
            message_id = msg.id(),
            "message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;

    fn publisher(mock: MockTransport) -> Arc<RabbitMQPublisher> {
        RabbitMQPublisher::new(Arc::new(mock), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn publish_stamps_correlation_headers() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|exchange, key, msg| {
                exchange == "events"
                    && key == "user.deleted"
                    && msg.retry_count() == 0
                    && msg.max_retries().is_none()
                    && msg.get_header(HEADER_MESSAGE_ID) == Some(&HeaderValue::from(msg.id()))
                    && msg.payload() == br#"{"userId":7}"#
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let id = publisher(mock)
            .publish(
                &Context::new(),
                "events",
                "user.deleted",
                &json!({"userId": 7}),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn options_override_id_and_budget() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|_, _, msg| {
                msg.id() == "order-42"
                    && msg.max_retries() == Some(0)
                    && msg.get_kind() == Some("OrderDeleted")
                    && msg.get_header("tenant") == Some(&HeaderValue::from("acme"))
                    && msg.get_header(HEADER_RETRY_COUNT) == Some(&HeaderValue::Int(0))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let options = PublishOptions::default()
            .message_id("order-42")
            .max_retries(0)
            .message_type("OrderDeleted")
            .header("tenant", "acme");

        let id = publisher(mock)
            .publish(&Context::new(), "events", "order.deleted", &json!({}), options)
            .await
            .unwrap();

        assert_eq!(id, "order-42");
    }

    #[tokio::test]
    async fn transport_failures_surface_as_publish_errors() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_, _, _| Err(AmqpError::PublishingError("connection reset".to_owned())));

        let res = publisher(mock)
            .publish(
                &Context::new(),
                "events",
                "user.deleted",
                &json!({}),
                PublishOptions::default(),
            )
            .await;

        assert_eq!(
            res,
            Err(AmqpError::PublishingError("connection reset".to_owned()))
        );
    }

    #[tokio::test]
    async fn caller_headers_cannot_replace_reserved_ones() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|_, _, msg| {
                msg.id() == "order-1"
                    && msg.get_header(HEADER_MESSAGE_ID) == Some(&HeaderValue::from("order-1"))
                    && msg.retry_count() == 0
                    && msg.max_retries().is_none()
                    && msg.get_header("tenant") == Some(&HeaderValue::from("acme"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let options = PublishOptions::default()
            .message_id("order-1")
            .header(HEADER_MESSAGE_ID, "forged")
            .header(HEADER_RETRY_COUNT, 5u32)
            .header(HEADER_MAX_RETRIES, 9u32)
            .header("tenant", "acme");

        publisher(mock)
            .publish(&Context::new(), "events", "order.deleted", &json!({}), options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unserializable_payloads_fail_to_publish() {
        use std::collections::HashMap;

        let mut mock = MockTransport::new();
        mock.expect_send().never();

        // JSON object keys must be strings.
        let payload: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);

        let res = publisher(mock)
            .publish(
                &Context::new(),
                "events",
                "order.deleted",
                &payload,
                PublishOptions::default(),
            )
            .await;

        assert!(matches!(res, Err(AmqpError::PublishingError(_))));
    }
}
