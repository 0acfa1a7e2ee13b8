// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backend Collaborators
//!
//! Message storage, ordering, durability and network transport are delegated
//! to a managed queue and topic service. This module defines the two client
//! interfaces the rest of the crate talks to: [`QueueClient`] for queues and
//! [`TopicClient`] for topics.

use crate::errors::MercuryError;
use async_trait::async_trait;
use std::{collections::HashMap, time::Duration};

/// Attribute carrying the backend's count of receives of a message
pub const ATTR_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

/// A message as received from a backend queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMessage {
    /// Backend-assigned message id
    pub message_id: String,
    /// Transport body: a serialized envelope or a notification wrapper
    pub body: String,
    /// Receipt handle used to acknowledge (delete) this delivery
    pub ack_handle: String,
    /// Backend system attributes
    pub attributes: HashMap<String, String>,
}

impl TransportMessage {
    /// Number of times the backend has handed this message out, when known.
    pub fn receive_count(&self) -> Option<u32> {
        self.attributes.get(ATTR_RECEIVE_COUNT)?.parse().ok()
    }
}

/// Client of the backend queue service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Creates the queue if needed and returns its url. Idempotent.
    async fn create_queue(&self, name: &str) -> Result<String, MercuryError>;

    /// Returns the ARN other backend resources use to reference the queue.
    async fn queue_arn(&self, queue_url: &str) -> Result<String, MercuryError>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), MercuryError>;

    /// Receives up to `max_messages`, waiting server-side up to `wait` for the first one.
    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<TransportMessage>, MercuryError>;

    /// Deletes a received message by its receipt handle.
    async fn delete_message(&self, queue_url: &str, ack_handle: &str) -> Result<(), MercuryError>;
}

/// Client of the backend topic service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopicClient: Send + Sync {
    /// Creates the topic if needed and returns its ARN. Idempotent.
    async fn create_topic(&self, name: &str) -> Result<String, MercuryError>;

    /// Subscribes a queue to a topic with raw message delivery, returning the subscription ARN.
    async fn subscribe_queue(&self, topic_arn: &str, queue_arn: &str) -> Result<String, MercuryError>;

    /// Publishes a transport body, returning the backend-assigned message id.
    async fn publish(&self, topic_arn: &str, body: &str) -> Result<String, MercuryError>;
}
