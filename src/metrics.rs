// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Delivery metrics collaborators. The crate reports to these traits and
//! leaves aggregation and export to the hosting application.

use crate::subscription::SubscriptionId;

/// Receives polling and consumption measurements from listeners and jobs.
#[cfg_attr(test, mockall::automock)]
pub trait ConsumerMetrics: Send + Sync {
    fn on_poll_success(&self, id: &SubscriptionId, count: usize);

    fn on_poll_failure(&self, id: &SubscriptionId);

    fn on_empty_poll(&self, id: &SubscriptionId);

    /// A poll returned as many messages as a single receive may return.
    fn on_full_batch_poll(&self, id: &SubscriptionId);

    fn on_consumption_success(&self, id: &SubscriptionId, duration_ms: u64);

    fn on_consumption_failure(&self, id: &SubscriptionId);

    /// Time between publication and consumption of a main-queue message.
    fn on_delivery_latency(&self, id: &SubscriptionId, latency_ms: u64);
}

/// Receives the outcome of every publication.
#[cfg_attr(test, mockall::automock)]
pub trait PublisherMetrics: Send + Sync {
    fn on_publication_success(&self, topic_name: &str);

    fn on_publication_failure(&self, topic_name: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConsumerMetrics;

impl ConsumerMetrics for NoopConsumerMetrics {
    fn on_poll_success(&self, _id: &SubscriptionId, _count: usize) {}

    fn on_poll_failure(&self, _id: &SubscriptionId) {}

    fn on_empty_poll(&self, _id: &SubscriptionId) {}

    fn on_full_batch_poll(&self, _id: &SubscriptionId) {}

    fn on_consumption_success(&self, _id: &SubscriptionId, _duration_ms: u64) {}

    fn on_consumption_failure(&self, _id: &SubscriptionId) {}

    fn on_delivery_latency(&self, _id: &SubscriptionId, _latency_ms: u64) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisherMetrics;

impl PublisherMetrics for NoopPublisherMetrics {
    fn on_publication_success(&self, _topic_name: &str) {}

    fn on_publication_failure(&self, _topic_name: &str) {}
}
