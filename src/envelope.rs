// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The envelope is the unit carried inside the transport message body: a
//! serialized payload with its content-type, identifiers, sender, timestamp
//! and optional metadata and correlation data.
//!
//! Two transport body formats are understood when decoding:
//! - a directly serialized envelope (JSON, camelCase fields), and
//! - a notification wrapper with `Subject` and `Message` string fields, where
//!   `Message` either holds a serialized envelope or a bare text payload.

use crate::errors::MercuryError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{collections::HashMap, ops::Deref};

/// Content type for plain text payloads
pub const CONTENT_TYPE_PLAIN: &str = "text/plain";
/// Content type for JSON payloads
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type for Thrift payloads in their JSON protocol encoding
pub const CONTENT_TYPE_THRIFT_JSON: &str = "application/x-thrift+json";

/// Metadata key holding the notification subject of legacy messages
pub const METADATA_SUBJECT: &str = "subject";

const NOTIFICATION_MESSAGE: &str = "Message";
const NOTIFICATION_SUBJECT: &str = "Subject";
const ENVELOPE_PAYLOAD_FIELD: &str = "serializedPayload";

/// Request and trace identifiers travelling with a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl CorrelationContext {
    pub fn is_empty(&self) -> bool {
        self.request_id.is_none()
            && self.trace_id.is_none()
            && self.span_id.is_none()
            && self.parent_span_id.is_none()
    }
}

/// The domain message wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub(crate) content_type: String,
    pub(crate) serialized_payload: String,
    #[serde(default)]
    pub(crate) message_id: String,
    #[serde(default)]
    pub(crate) topic_name: String,
    #[serde(default)]
    pub(crate) sender_app_id: String,
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub(crate) timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) correlation: Option<CorrelationContext>,
}

impl Envelope {
    /// Creates an envelope stamped with the current time and no identifiers.
    pub fn new(topic_name: &str, content_type: &str, serialized_payload: &str) -> Envelope {
        Envelope {
            content_type: content_type.to_owned(),
            serialized_payload: serialized_payload.to_owned(),
            message_id: String::new(),
            topic_name: topic_name.to_owned(),
            sender_app_id: String::new(),
            timestamp: Utc::now(),
            metadata: None,
            correlation: None,
        }
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = message_id.to_owned();
        self
    }

    pub fn with_sender_app_id(mut self, sender_app_id: &str) -> Self {
        self.sender_app_id = sender_app_id.to_owned();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationContext) -> Self {
        self.correlation = Some(correlation).filter(|c| !c.is_empty());
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn serialized_payload(&self) -> &str {
        &self.serialized_payload
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn sender_app_id(&self) -> &str {
        &self.sender_app_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> Option<&HashMap<String, String>> {
        self.metadata.as_ref()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(String::as_str)
    }

    pub fn correlation(&self) -> Option<&CorrelationContext> {
        self.correlation.as_ref()
    }

    /// Milliseconds elapsed between the envelope timestamp and `now`, floored at zero.
    pub fn latency_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.timestamp).num_milliseconds()).unwrap_or(0)
    }

    /// Serializes the whole envelope into a transport message body.
    pub fn to_transport_body(&self) -> Result<String, MercuryError> {
        serde_json::to_string(self).map_err(|err| MercuryError::SerializationError(err.to_string()))
    }

    /// Decodes a transport message body into an envelope.
    ///
    /// `fallback_topic` names the topic of envelopes synthesized from legacy
    /// notifications, which carry no topic of their own.
    pub fn from_transport_body(body: &str, fallback_topic: &str) -> Result<Envelope, MercuryError> {
        let value: Value =
            serde_json::from_str(body).map_err(|err| MercuryError::DecodeError(err.to_string()))?;

        if value.get(ENVELOPE_PAYLOAD_FIELD).is_some() {
            return Self::from_value(value);
        }

        let Some(message) = value.get(NOTIFICATION_MESSAGE).and_then(Value::as_str) else {
            return Err(MercuryError::DecodeError(
                "body is neither an envelope nor a notification".to_owned(),
            ));
        };

        if let Ok(inner) = serde_json::from_str::<Value>(message) {
            if inner.get(ENVELOPE_PAYLOAD_FIELD).is_some() {
                return Self::from_value(inner);
            }
        }

        let mut envelope = Envelope::new(fallback_topic, CONTENT_TYPE_PLAIN, message);
        if let Some(subject) = value.get(NOTIFICATION_SUBJECT).and_then(Value::as_str) {
            envelope = envelope.with_metadata(METADATA_SUBJECT, subject);
        }
        Ok(envelope)
    }

    fn from_value(value: Value) -> Result<Envelope, MercuryError> {
        serde_json::from_value(value).map_err(|err| MercuryError::DecodeError(err.to_string()))
    }
}

/// An envelope together with its decoded payload.
///
/// Built only by the registry-driven decode step of typed consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEnvelope<T> {
    envelope: Envelope,
    payload: T,
}

impl<T> TypedEnvelope<T> {
    pub(crate) fn new(envelope: Envelope, payload: T) -> TypedEnvelope<T> {
        TypedEnvelope { envelope, payload }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn into_parts(self) -> (Envelope, T) {
        (self.envelope, self.payload)
    }
}

impl<T> Deref for TypedEnvelope<T> {
    type Target = Envelope;

    fn deref(&self) -> &Self::Target {
        &self.envelope
    }
}

fn serialize_timestamp<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i64(timestamp.timestamp_millis())
}

/// Accepts epoch milliseconds or an RFC 3339 string.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}
