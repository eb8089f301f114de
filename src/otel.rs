// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers: the publisher injects
//! the caller's context, and the consumer extracts it to parent the span it
//! opens around each delivery.

use crate::message::{HeaderValue, Message};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Injects trace context into outgoing message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, HeaderValue>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, HeaderValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

/// Reads trace context from incoming message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, HeaderValue>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, HeaderValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Serializes `ctx` with the globally configured propagator.
pub(crate) fn inject(ctx: &Context) -> BTreeMap<String, HeaderValue> {
    let mut headers = BTreeMap::new();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(&mut headers))
    });
    headers
}

/// Creates a consumer span for processing `msg`, parented on the context it carries.
pub(crate) fn new_span(msg: &Message, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(msg.header_map()))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc".to_owned());
        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::from("00-abc"))
        );
    }

    #[test]
    fn extractor_only_exposes_string_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("traceparent".to_owned(), HeaderValue::from("00-abc"));
        headers.insert("retryCount".to_owned(), HeaderValue::Int(1));

        let extractor = HeaderExtractor::new(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("retryCount"), None);
        assert_eq!(extractor.keys().len(), 2);
    }
}
