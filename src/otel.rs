// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace-Context Propagation
//!
//! Carries OpenTelemetry context through the transport's string header map:
//! injected into outgoing messages by the dispatcher, extracted in the pump
//! worker before the handler runs.

use crate::message::IncomingMessage;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::HashMap;

pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut HashMap<String, String>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut HashMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|key| key.as_str()).collect()
    }
}

/// Injects the given context into an outgoing header map.
pub(crate) fn inject(ctx: &Context, headers: &mut HashMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderCarrier::new(headers))
    });
}

/// Extracts the upstream context from a reconstructed message and opens a
/// consumer span for its processing.
pub(crate) fn consumer_span(tracer: &BoxedTracer, message: &IncomingMessage) -> (Context, BoxedSpan) {
    let mut headers = message.headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    let span = tracer
        .span_builder(format!("receive {}", message.message_id))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_round_trips_keys() {
        let mut headers = HashMap::default();

        {
            let mut carrier = HeaderCarrier::new(&mut headers);
            carrier.set("TraceParent", "00-abc-def-01".to_owned());
        }

        let carrier = HeaderCarrier::new(&mut headers);
        assert_eq!(carrier.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(carrier.keys(), vec!["traceparent"]);
    }
}
