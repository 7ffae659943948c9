// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Published messages carry the current OpenTelemetry context in their AMQP
//! headers; consumers extract it and open a consumer span per delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Tracer name used for consumer spans
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Reads and writes trace headers on an AMQP header table.
pub(crate) struct AmqpHeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpHeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpHeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for AmqpHeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(&ShortString::from(key)) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Adds the trace context of `ctx` to an existing header table.
pub(crate) fn inject_context(ctx: &Context, headers: Option<&FieldTable>) -> FieldTable {
    let mut btree = headers.map(|h| h.inner().clone()).unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpHeaderPropagator::new(&mut btree))
    });

    FieldTable::from(btree)
}

/// Extracts the producer context of a delivery and starts a consumer span in it.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|h| h.inner().clone())
        .unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpHeaderPropagator::new(&mut headers))
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
    use lapin::types::LongString;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        AmqpHeaderPropagator::new(&mut headers).set("TraceParent", "00-abc-01".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc-01")))
        );
    }

    #[test]
    fn extractor_ignores_non_string_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("count"), AMQPValue::LongInt(3));
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-01")),
        );

        let propagator = AmqpHeaderPropagator::new(&mut headers);

        assert_eq!(propagator.get("count"), None);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-01"));
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn inject_keeps_existing_headers() {
        let mut existing = FieldTable::default();
        existing.insert(ShortString::from("tenant"), AMQPValue::LongString("acme".into()));

        let headers = inject_context(&Context::current(), Some(&existing));

        assert!(headers.inner().contains_key(&ShortString::from("tenant")));
    }
}
