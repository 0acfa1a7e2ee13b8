// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Publisher
//!
//! This module provides the publisher side of mercury. A [`TopicPublisher`]
//! is bound to one backend topic and builds [`MessageToPublish`] values, which
//! are envelopes accumulating metadata until `publish()` hands them to the
//! topic client.
//!
//! Publishers are obtained from the [`TopicPublishersFactory`], which creates
//! the backend topic on first use and caches one publisher per topic.

use crate::{
    backend::TopicClient,
    config::PublisherConfig,
    envelope::{
        CorrelationContext, Envelope, CONTENT_TYPE_JSON, CONTENT_TYPE_PLAIN,
        CONTENT_TYPE_THRIFT_JSON,
    },
    errors::MercuryError,
    metrics::{NoopPublisherMetrics, PublisherMetrics},
    otel,
    serialization::{Payload, SerializationRegistry},
    subscription::topic_name,
};
use chrono::Utc;
use dashmap::DashMap;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Generates the id of messages published without an explicit one.
pub type MessageIdSupplier = Arc<dyn Fn() -> String + Send + Sync>;

/// Reads the correlation data of the publishing context.
pub type CorrelationSupplier = Arc<dyn Fn() -> Option<CorrelationContext> + Send + Sync>;

/// Publisher bound to a single topic.
///
/// The publisher is shared: every message built from it borrows it, and many
/// messages can be built and published concurrently.
pub struct TopicPublisher {
    topic_name: String,
    topic_arn: String,
    sender_app_id: String,
    topic_client: Arc<dyn TopicClient>,
    serialization: Arc<SerializationRegistry>,
    metrics: Arc<dyn PublisherMetrics>,
    message_id_supplier: MessageIdSupplier,
    correlation_supplier: Option<CorrelationSupplier>,
}

impl TopicPublisher {
    /// Topic name without the publishers' prefix.
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }

    /// Builds a message from an already serialized payload.
    pub fn message_with_serialized_payload(
        &self,
        serialized_payload: &str,
        content_type: &str,
    ) -> MessageToPublish<'_> {
        let envelope = Envelope::new(&self.topic_name, content_type, serialized_payload)
            .with_sender_app_id(&self.sender_app_id);

        MessageToPublish {
            publisher: self,
            envelope,
        }
    }

    pub fn message_with_text_payload(&self, text: &str) -> MessageToPublish<'_> {
        self.message_with_serialized_payload(text, CONTENT_TYPE_PLAIN)
    }

    /// Builds a message whose payload is serialized by the registry for `content_type`.
    pub fn message_with_object_payload<T: Payload>(
        &self,
        value: &T,
        content_type: &str,
    ) -> Result<MessageToPublish<'_>, MercuryError> {
        let serialized = self.serialization.serialize(value, content_type)?;
        Ok(self.message_with_serialized_payload(&serialized, content_type))
    }

    pub fn message_with_json_payload<T: Payload>(
        &self,
        value: &T,
    ) -> Result<MessageToPublish<'_>, MercuryError> {
        self.message_with_object_payload(value, CONTENT_TYPE_JSON)
    }

    pub fn message_with_thrift_payload<T: Payload>(
        &self,
        value: &T,
    ) -> Result<MessageToPublish<'_>, MercuryError> {
        self.message_with_object_payload(value, CONTENT_TYPE_THRIFT_JSON)
    }
}

/// An envelope being prepared for publication.
#[derive(Clone)]
pub struct MessageToPublish<'p> {
    publisher: &'p TopicPublisher,
    envelope: Envelope,
}

impl MessageToPublish<'_> {
    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.envelope = self.envelope.with_message_id(message_id);
        self
    }

    pub fn add_metadata(mut self, key: &str, value: &str) -> Self {
        self.envelope = self.envelope.with_metadata(key, value);
        self
    }

    pub fn extend_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        if !metadata.is_empty() {
            self.envelope
                .metadata
                .get_or_insert_with(HashMap::new)
                .extend(metadata);
        }
        self
    }

    /// Overrides the correlation data otherwise read from the publisher's supplier.
    pub fn with_correlation(mut self, correlation: CorrelationContext) -> Self {
        self.envelope = self.envelope.with_correlation(correlation);
        self
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Publishes the message and returns the id assigned by the backend.
    ///
    /// The timestamp is stamped here, and a message id is generated when none
    /// was set. Failures are reported to the caller and never retried.
    pub async fn publish(self) -> Result<String, MercuryError> {
        let publisher = self.publisher;
        let envelope = self.prepare();

        match publisher.send(&envelope).await {
            Ok(backend_id) => {
                publisher.metrics.on_publication_success(&publisher.topic_name);
                debug!(
                    topic = %publisher.topic_name,
                    message_id = %envelope.message_id,
                    %backend_id,
                    "message published"
                );
                Ok(backend_id)
            }
            Err(err) => {
                publisher.metrics.on_publication_failure(&publisher.topic_name);
                error!(
                    topic = %publisher.topic_name,
                    message_id = %envelope.message_id,
                    error = err.to_string(),
                    "failure to publish message"
                );
                Err(err)
            }
        }
    }

    fn prepare(self) -> Envelope {
        let publisher = self.publisher;
        let mut envelope = self.envelope.with_timestamp(Utc::now());

        if envelope.message_id.is_empty() {
            envelope.message_id = (publisher.message_id_supplier)();
        }

        if envelope.correlation.is_none() {
            if let Some(correlation) = publisher.correlation_supplier.as_ref().and_then(|s| s()) {
                envelope = envelope.with_correlation(correlation);
            }
        }

        let mut trace_metadata = HashMap::new();
        otel::inject_current_context(&mut trace_metadata);
        if !trace_metadata.is_empty() {
            envelope
                .metadata
                .get_or_insert_with(HashMap::new)
                .extend(trace_metadata);
        }

        envelope
    }
}

impl TopicPublisher {
    async fn send(&self, envelope: &Envelope) -> Result<String, MercuryError> {
        let body = envelope.to_transport_body()?;

        self.topic_client
            .publish(&self.topic_arn, &body)
            .await
            .map_err(|err| match err {
                err @ MercuryError::PublishingError(_) => err,
                _ => MercuryError::PublishingError(self.topic_name.clone()),
            })
    }
}

/// Creates and caches the publishers of an application.
pub struct TopicPublishersFactory {
    config: PublisherConfig,
    sender_app_id: String,
    topic_client: Arc<dyn TopicClient>,
    serialization: Arc<SerializationRegistry>,
    metrics: Arc<dyn PublisherMetrics>,
    message_id_supplier: MessageIdSupplier,
    correlation_supplier: Option<CorrelationSupplier>,
    publishers: DashMap<String, Arc<TopicPublisher>>,
}

impl TopicPublishersFactory {
    /// Message ids default to random UUIDs; no metrics and no correlation data.
    pub fn new(
        config: PublisherConfig,
        sender_app_id: &str,
        topic_client: Arc<dyn TopicClient>,
        serialization: Arc<SerializationRegistry>,
    ) -> TopicPublishersFactory {
        TopicPublishersFactory {
            config,
            sender_app_id: sender_app_id.to_owned(),
            topic_client,
            serialization,
            metrics: Arc::new(NoopPublisherMetrics),
            message_id_supplier: Arc::new(|| Uuid::new_v4().to_string()),
            correlation_supplier: None,
            publishers: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn PublisherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_message_id_supplier<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.message_id_supplier = Arc::new(supplier);
        self
    }

    pub fn with_correlation_supplier<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> Option<CorrelationContext> + Send + Sync + 'static,
    {
        self.correlation_supplier = Some(Arc::new(supplier));
        self
    }

    /// Returns the publisher of `topic`, creating the backend topic on first use.
    ///
    /// Later calls for the same topic return the same publisher.
    pub async fn publisher(&self, topic: &str) -> Result<Arc<TopicPublisher>, MercuryError> {
        let full_name = topic_name(&self.config.topic_names_prefix, topic);
        if let Some(publisher) = self.publishers.get(&full_name) {
            return Ok(publisher.value().clone());
        }

        let topic_arn = self.topic_client.create_topic(&full_name).await?;
        info!(topic, %topic_arn, "topic prepared for publishing");

        let publisher = Arc::new(TopicPublisher {
            topic_name: topic.to_owned(),
            topic_arn,
            sender_app_id: self.sender_app_id.clone(),
            topic_client: self.topic_client.clone(),
            serialization: self.serialization.clone(),
            metrics: self.metrics.clone(),
            message_id_supplier: self.message_id_supplier.clone(),
            correlation_supplier: self.correlation_supplier.clone(),
        });

        Ok(self
            .publishers
            .entry(full_name)
            .or_insert(publisher)
            .value()
            .clone())
    }

    /// Creates the publishers of every configured topic.
    pub async fn prepare(&self) -> Result<(), MercuryError> {
        for topic in &self.config.topics_for_publishing {
            self.publisher(topic).await?;
        }
        Ok(())
    }
}
