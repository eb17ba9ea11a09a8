// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context rides inside the envelope's `headers` map, the free-form
//! metadata section of the MassTransit convention. This module adapts that
//! map to the OpenTelemetry propagation traits so producers can inject the
//! current context and consumers can resume it when a message is dispatched.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use serde_json::Value;
use std::{borrow::Cow, collections::HashMap};

/// Adapter over an envelope header map for trace-context propagation.
pub(crate) struct EnvelopeHeaderPropagator<'a> {
    headers: &'a mut HashMap<String, Value>,
}

impl<'a> EnvelopeHeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut HashMap<String, Value>) -> Self {
        Self { headers }
    }
}

impl Injector for EnvelopeHeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), Value::String(value));
    }
}

impl Extractor for EnvelopeHeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|key| key.as_str()).collect()
    }
}

/// Resumes the trace context carried by an envelope and opens a consumer span
/// for processing one message.
pub(crate) fn consumer_span(
    headers: &HashMap<String, Value>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&EnvelopeHeaderPropagator::new(&mut headers.clone()))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
