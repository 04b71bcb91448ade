// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside AMQP message headers: the publisher injects the
//! current context, the consumption loop extracts it and opens a consumer span
//! per delivery.

use crate::broker::Headers;
use lapin::types::{AMQPValue, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use tracing::warn;

/// Name of the tracer used for consumer spans
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// `Injector` over outgoing AMQP headers. Keys are stored lowercased.
pub(crate) struct HeaderInjector<'a>(pub(crate) &'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = ShortString::from(key.to_ascii_lowercase());
        self.0.insert(key, AMQPValue::LongString(LongString::from(value)));
    }
}

/// `Extractor` over the headers of a delivery.
pub(crate) struct HeaderExtractor<'a>(pub(crate) &'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            AMQPValue::LongString(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(header = key, error = err.to_string(), "non utf-8 trace header");
                    None
                }
            },
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(ShortString::as_str).collect()
    }
}

/// Injects the current trace context into `headers`.
pub(crate) fn inject_current(headers: &mut Headers) {
    let cx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderInjector(headers))
    });
}

/// Starts a consumer span for a delivery on `queue`, child of the context
/// carried in its headers.
pub(crate) fn consumer_span(tracer: &BoxedTracer, headers: &Headers, queue: &str) -> BoxedSpan {
    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });

    tracer
        .span_builder(format!("{queue} process"))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();
        HeaderInjector(&mut headers).set("TraceParent", "00-abc-01".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString("00-abc-01".into()))
        );
    }

    #[test]
    fn extractor_ignores_non_string_values() {
        let mut headers = Headers::new();
        headers.insert("traceparent".into(), AMQPValue::LongString("00-abc-01".into()));
        headers.insert("x-count".into(), AMQPValue::LongInt(3));

        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-abc-01"));
        assert_eq!(extractor.get("x-count"), None);
        assert_eq!(extractor.keys(), vec!["traceparent", "x-count"]);
    }

    #[test]
    fn missing_header_yields_none() {
        let headers = Headers::new();
        assert_eq!(HeaderExtractor(&headers).get("traceparent"), None);
    }
}
