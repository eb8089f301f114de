// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The broker-agnostic representation of a message travelling through the
//! client. A [`Message`] is immutable once built: retry bookkeeping produces a
//! new envelope via [`Message::with_retry_count`] instead of mutating the one
//! that was delivered.
//!
//! Correlation metadata travels as headers:
//! - `messageId`: the opaque unique id, mirrored in the AMQP `message_id` property
//! - `retryCount`: number of application-level redeliveries so far (absent means 0)
//! - `maxRetries`: optional per-message override of the consumer retry budget

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the number of application-level redeliveries
pub const HEADER_RETRY_COUNT: &str = "retryCount";
/// Header carrying a per-message retry budget override
pub const HEADER_MAX_RETRIES: &str = "maxRetries";
/// Header mirroring the message id
pub const HEADER_MESSAGE_ID: &str = "messageId";

/// AMQP delivery mode marking a message as persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A header value the client understands.
///
/// Broker-specific values with no counterpart here (arrays, nested tables,
/// decimals) are dropped when a delivery is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Reads the value as a non-negative counter; numeric strings are accepted.
    pub fn as_count(&self) -> Option<u32> {
        match self {
            HeaderValue::Int(v) => u32::try_from(*v).ok(),
            HeaderValue::String(v) => v.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        }
    }
}

fn header_from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
    let header = match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
        AMQPValue::LongString(v) => {
            HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        _ => return None,
    };

    Some(header)
}

/// Immutable message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    payload: Vec<u8>,
    content_type: String,
    kind: Option<String>,
    headers: BTreeMap<String, HeaderValue>,
}

impl Message {
    /// Creates a JSON message with the given id and a zero retry count.
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Message {
        let id = id.into();
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_MESSAGE_ID.to_owned(), HeaderValue::from(id.clone()));
        headers.insert(HEADER_RETRY_COUNT.to_owned(), HeaderValue::Int(0));

        Message {
            id,
            payload,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            kind: None,
            headers,
        }
    }

    /// Creates a message with a freshly generated id.
    pub fn with_generated_id(payload: Vec<u8>) -> Message {
        Message::new(Uuid::new_v4().to_string(), payload)
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, HeaderValue>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Returns a copy of this message carrying `retry_count`.
    pub fn with_retry_count(&self, retry_count: u32) -> Message {
        self.clone().header(HEADER_RETRY_COUNT, retry_count)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn get_content_type(&self) -> &str {
        &self.content_type
    }

    pub fn get_kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn get_header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn header_map(&self) -> &BTreeMap<String, HeaderValue> {
        &self.headers
    }

    /// Application-level redeliveries so far; absent or malformed headers count as 0.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(HEADER_RETRY_COUNT)
            .and_then(HeaderValue::as_count)
            .unwrap_or_default()
    }

    /// Retry budget stamped by the publisher, if any.
    pub fn max_retries(&self) -> Option<u32> {
        self.headers
            .get(HEADER_MAX_RETRIES)
            .and_then(HeaderValue::as_count)
    }

    pub(crate) fn amqp_properties(&self) -> BasicProperties {
        let headers: BTreeMap<ShortString, AMQPValue> = self
            .headers
            .iter()
            .map(|(k, v)| (ShortString::from(k.clone()), AMQPValue::from(v)))
            .collect();

        let props = BasicProperties::default()
            .with_message_id(ShortString::from(self.id.clone()))
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(FieldTable::from(headers));

        match &self.kind {
            Some(kind) => props.with_type(ShortString::from(kind.clone())),
            None => props,
        }
    }

    /// Rebuilds the envelope from a lapin delivery.
    pub(crate) fn from_amqp(props: &AMQPProperties, data: Vec<u8>) -> Message {
        let headers: BTreeMap<String, HeaderValue> = props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(k, v)| header_from_amqp(v).map(|v| (k.as_str().to_owned(), v)))
                    .collect()
            })
            .unwrap_or_default();

        let id = props
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .or_else(|| {
                headers
                    .get(HEADER_MESSAGE_ID)
                    .and_then(HeaderValue::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Message {
            id,
            payload: data,
            content_type: props
                .content_type()
                .as_ref()
                .map(|c| c.as_str().to_owned())
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            kind: props.kind().as_ref().map(|k| k.as_str().to_owned()),
            headers,
        }
    }
}
