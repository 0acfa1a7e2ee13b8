// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for Envelopes
//!
//! Trace context travels inside the envelope metadata: publishers inject the
//! current context through the global text-map propagator and consumption
//! jobs extract it to parent their consumer span. Without a globally
//! installed propagator both sides are no-ops.

use opentelemetry::{
    global::BoxedTracer,
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::HashMap};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directives
pub const LOG_ENV_VAR: &str = "MERCURY_LOG";

/// Name of the tracer used for producer and consumer spans
pub(crate) const TRACER_NAME: &str = "mercury";

/// Adapter writing trace context entries into envelope metadata.
///
/// Keys are stored lowercased, matching the case-insensitive header names
/// used by the W3C and B3 formats.
///
/// # Parameters
/// * `metadata` - Envelope metadata receiving the propagation entries
pub(crate) struct MetadataInjector<'a> {
    metadata: &'a mut HashMap<String, String>,
}

impl<'a> MetadataInjector<'a> {
    pub(crate) fn new(metadata: &'a mut HashMap<String, String>) -> Self {
        Self { metadata }
    }
}

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.metadata.insert(key.to_lowercase(), value);
    }
}

/// Adapter reading trace context entries from envelope metadata.
///
/// Envelopes published without metadata extract as an empty carrier.
///
/// # Parameters
/// * `metadata` - Envelope metadata, if the envelope carried any
pub(crate) struct MetadataExtractor<'a> {
    metadata: Option<&'a HashMap<String, String>>,
}

impl<'a> MetadataExtractor<'a> {
    pub(crate) fn new(metadata: Option<&'a HashMap<String, String>>) -> Self {
        Self { metadata }
    }
}

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.metadata?.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.metadata
            .map(|metadata| metadata.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Injects the current trace context into envelope metadata.
///
/// # Parameters
/// * `metadata` - Metadata map extended with the propagator's entries
///
/// The global propagator decides what is written; with none installed the
/// map is left untouched.
pub(crate) fn inject_current_context(metadata: &mut HashMap<String, String>) {
    let ctx = Context::current();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut MetadataInjector::new(metadata))
    });
}

/// Starts a consumer span parented by the context carried in envelope metadata.
///
/// # Parameters
/// * `metadata` - Envelope metadata to extract the remote parent from
/// * `tracer` - Tracer creating the span
/// * `name` - Span name, the topic the envelope was published to
///
/// # Returns
/// A context holding the extracted parent with the new span active in it.
/// Run the handler under this context so the spans it opens become children
/// of the consumer span.
pub(crate) fn consumer_span_context(
    metadata: Option<&HashMap<String, String>>,
    tracer: &BoxedTracer,
    name: &str,
) -> Context {
    let parent = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&MetadataExtractor::new(metadata))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent);

    parent.with_span(span)
}

/// Installs a fmt subscriber filtered by `MERCURY_LOG` (default `info`).
///
/// Does nothing when a global subscriber is already installed, so tests and
/// applications with their own subscriber can call it freely.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
