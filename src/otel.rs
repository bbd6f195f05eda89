// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Publishers inject the current OpenTelemetry context into the AMQP headers;
//! consumers extract it and open a consumer span per delivery, so a trace can
//! follow an event from the service that emitted it to every service handling
//! it.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Tracer name used for consumer spans
pub(crate) const TRACER_NAME: &str = "amqp consumer";

/// Adapter letting OpenTelemetry read and write AMQP header tables.
pub(crate) struct AmqpHeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpHeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpHeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for AmqpHeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpHeaderCarrier::new(headers))
    });
}

/// Extracts the publisher's trace context from `headers` and starts a
/// consumer span named after the routing key.
pub(crate) fn consumer_span(
    headers: &FieldTable,
    tracer: &BoxedTracer,
    queue: &str,
    routing_key: &str,
) -> (Context, BoxedSpan) {
    let mut inner = headers.inner().clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpHeaderCarrier::new(&mut inner))
    });

    let span = tracer
        .span_builder(Cow::from(routing_key.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.destination.name", queue.to_owned()),
            KeyValue::new("messaging.rabbitmq.destination.routing_key", routing_key.to_owned()),
        ])
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn carrier_lowercases_injected_keys() {
        let mut headers = BTreeMap::new();
        AmqpHeaderCarrier::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc-def-01")))
        );
    }

    #[test]
    fn carrier_ignores_non_string_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("x-retry-count"), AMQPValue::LongLongInt(3));
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );

        let carrier = AmqpHeaderCarrier::new(&mut headers);

        assert_eq!(carrier.get("x-retry-count"), None);
        assert_eq!(carrier.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(carrier.keys().len(), 2);
    }
}
