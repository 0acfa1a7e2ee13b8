// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for Mercury
//!
//! This module provides the error types for publication, consumption and
//! registry operations. The `MercuryError` enum covers backend failures
//! (polling, deletion, provisioning), per-message failures (decode, handler)
//! and programming errors surfaced by the registries (missing serializer,
//! deserializer or consumer).

use thiserror::Error;

/// Boxed error returned by user handlers and (de)serializer functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during Mercury operations.
///
/// Backend errors are recovered by the natural retry cadence (next poll tick,
/// redelivery after visibility timeout). Registry errors are raised
/// synchronously to the caller of the registry operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MercuryError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// No consumer is registered for the subscription and queue kind
    #[error("no consumer registered for `{0}`")]
    NoConsumerRegistered(String),

    /// The receive call against a queue failed
    #[error("failure to poll queue `{0}`")]
    PollingError(String),

    /// The transport body or payload could not be decoded
    #[error("failure to decode message: {0}")]
    DecodeError(String),

    /// A user handler returned an error
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Acknowledging (deleting) a message failed
    #[error("failure to delete message: {0}")]
    DeletionError(String),

    /// No serializer resolved for the content-type and payload type
    #[error("no `{content_type}` serializer registered for `{type_name}`")]
    NoSerializerRegistered {
        content_type: String,
        type_name: String,
    },

    /// No deserializer registered for the content-type
    #[error("no deserializer registered for `{0}`")]
    NoDeserializerRegistered(String),

    /// A registered serializer failed
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Handing the envelope to the topic client failed
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// A configuration value is outside its allowed range
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Two subscriptions of one application share an identity
    #[error("duplicate subscription `{0}`")]
    DuplicateSubscription(String),

    /// Creating or configuring a topic, queue or subscription failed
    #[error("failure to provision `{0}`")]
    ProvisioningError(String),

    /// Reading configuration sources failed
    #[error("failure to load configuration: {0}")]
    ConfigLoadError(String),
}
