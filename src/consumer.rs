// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Job
//!
//! Processes one received message: locates its handler, invokes it and
//! deletes the message from the queue on success. On any failure the message
//! stays on the queue and the backend redelivers it once its visibility
//! timeout expires, eventually redriving it to the dead-letter queue.

use crate::{
    backend::{QueueClient, TransportMessage},
    envelope::{CorrelationContext, Envelope},
    errors::{BoxError, MercuryError},
    metrics::ConsumerMetrics,
    otel,
    registry::{ConsumerRegistry, EnvelopeHandler},
    subscription::{QueueKind, SubscriptionId},
};
use chrono::Utc;
use opentelemetry::{
    global::BoxedTracer,
    trace::{FutureExt, Status, TraceContextExt},
};
use std::{borrow::Cow, sync::Arc};
use tokio::time::Instant;
use tracing::{debug, error, field, info_span, warn, Instrument};

/// The queue a message was received from.
#[derive(Debug, Clone)]
pub(crate) struct QueueTarget {
    pub(crate) id: SubscriptionId,
    pub(crate) kind: QueueKind,
    pub(crate) url: String,
}

impl QueueTarget {
    pub(crate) fn label(&self) -> String {
        self.kind.label(&self.id)
    }
}

/// Collaborators shared by every consumption job.
#[derive(Clone)]
pub(crate) struct Consumption {
    pub(crate) registry: Arc<ConsumerRegistry>,
    pub(crate) queue_client: Arc<dyn QueueClient>,
    pub(crate) metrics: Arc<dyn ConsumerMetrics>,
    pub(crate) tracer: Arc<BoxedTracer>,
}

impl Consumption {
    /// Consumes a message received from `target`.
    ///
    /// A transport handler takes precedence over an envelope handler. Errors
    /// are logged and metered here; the returned result only reports the
    /// outcome to the caller.
    ///
    /// The job runs inside a `consume` span. Once the envelope is decoded its
    /// correlation ids are recorded on that span, so every event the handler
    /// logs carries them.
    pub(crate) async fn consume(
        &self,
        target: &QueueTarget,
        message: TransportMessage,
    ) -> Result<(), MercuryError> {
        let span = info_span!(
            "consume",
            subscription = %target.label(),
            message_id = %message.message_id,
            request_id = field::Empty,
            trace_id = field::Empty,
            span_id = field::Empty,
            parent_span_id = field::Empty,
        );

        async {
            if let Some(handler) = self.registry.get_transport_consumer(&target.id, target.kind) {
                let started = Instant::now();
                return match handler.handle(&message).await {
                    Ok(()) => {
                        self.succeeded(target, started);
                        self.delete(target, &message).await;
                        Ok(())
                    }
                    Err(err) => Err(self.failed(target, MercuryError::HandlerError(err.to_string()))),
                };
            }

            match self.registry.get_consumer(&target.id, target.kind) {
                Some(handler) => self.consume_envelope(target, &message, handler.as_ref()).await,
                None => {
                    error!("no consumer found for received message, leaving it on the queue");
                    Err(MercuryError::NoConsumerRegistered(target.label()))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn consume_envelope(
        &self,
        target: &QueueTarget,
        message: &TransportMessage,
        handler: &dyn EnvelopeHandler,
    ) -> Result<(), MercuryError> {
        let started = Instant::now();

        let envelope = match Envelope::from_transport_body(&message.body, target.id.topic_name()) {
            Ok(envelope) => envelope,
            Err(err) => return Err(self.failed(target, err)),
        };

        if let Some(correlation) = envelope.correlation() {
            record_correlation(correlation);
        }

        if !target.kind.is_dead_letter() {
            self.metrics
                .on_delivery_latency(&target.id, envelope.latency_ms(Utc::now()));
        }

        let cx = otel::consumer_span_context(envelope.metadata(), &self.tracer, envelope.topic_name());

        debug!(
            content_type = envelope.content_type(),
            topic = envelope.topic_name(),
            "dispatching envelope"
        );

        let outcome = handler.handle(envelope).with_context(cx.clone()).await;
        let span = cx.span();

        let result = match outcome {
            Ok(()) => {
                span.set_status(Status::Ok);
                self.succeeded(target, started);
                self.delete(target, message).await;
                Ok(())
            }
            Err(err) => {
                span.record_error(err.as_ref());
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                Err(self.failed(target, classify(err)))
            }
        };

        span.end();
        result
    }

    fn succeeded(&self, target: &QueueTarget, started: Instant) {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(duration_ms, "message successfully processed");
        self.metrics.on_consumption_success(&target.id, duration_ms);
    }

    fn failed(&self, target: &QueueTarget, err: MercuryError) -> MercuryError {
        error!(error = err.to_string(), "failure to consume message, leaving it for redelivery");
        self.metrics.on_consumption_failure(&target.id);
        err
    }

    /// Deletion failures are only logged: the message reappears after its
    /// visibility timeout and is consumed again.
    async fn delete(&self, target: &QueueTarget, message: &TransportMessage) {
        if let Err(err) = self
            .queue_client
            .delete_message(&target.url, &message.ack_handle)
            .await
        {
            warn!(error = err.to_string(), "failure to delete consumed message");
        }
    }
}

fn record_correlation(correlation: &CorrelationContext) {
    let span = tracing::Span::current();
    let fields = [
        ("request_id", &correlation.request_id),
        ("trace_id", &correlation.trace_id),
        ("span_id", &correlation.span_id),
        ("parent_span_id", &correlation.parent_span_id),
    ];

    for (name, value) in fields {
        if let Some(value) = value {
            span.record(name, value.as_str());
        }
    }
}

/// Keeps typed-decode failures distinguishable from handler failures.
fn classify(err: BoxError) -> MercuryError {
    match err.downcast::<MercuryError>() {
        Ok(err) => match *err {
            MercuryError::DecodeError(reason) => MercuryError::DecodeError(reason),
            missing @ MercuryError::NoDeserializerRegistered(_) => {
                MercuryError::DecodeError(missing.to_string())
            }
            other => MercuryError::HandlerError(other.to_string()),
        },
        Err(err) => MercuryError::HandlerError(err.to_string()),
    }
}
