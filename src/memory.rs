// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! Thread-safe topic and queue backend for tests and local development.
//!
//! ## Behavior
//!
//! - **Fan-out**: publishing to a topic enqueues a copy on every subscribed queue
//! - **Visibility timeout**: received messages stay hidden for the queue's
//!   `VisibilityTimeout` unless deleted
//! - **Redrive**: a message whose receive count reached the queue's
//!   `maxReceiveCount` moves to the dead-letter target on its next receive
//! - **Long polling**: receives wait up to the requested duration for a message

use crate::{
    backend::{QueueClient, TopicClient, TransportMessage, ATTR_RECEIVE_COUNT},
    errors::MercuryError,
    queue::{ATTR_DELAY_SECONDS, ATTR_REDRIVE_POLICY, ATTR_VISIBILITY_TIMEOUT},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::{
    sync::{Notify, RwLock},
    time::Instant,
};
use uuid::Uuid;

const QUEUE_URL_PREFIX: &str = "memory://queues/";
const QUEUE_ARN_PREFIX: &str = "arn:memory:queue:";
const TOPIC_ARN_PREFIX: &str = "arn:memory:topic:";
const DEFAULT_VISIBILITY_TIMEOUT_SEC: u64 = 30;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

impl StoredMessage {
    fn new(message_id: &str, body: &str, visible_at: Instant) -> StoredMessage {
        StoredMessage {
            message_id: message_id.to_owned(),
            body: body.to_owned(),
            visible_at,
            receive_count: 0,
            receipt: None,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryQueue {
    arn: String,
    attributes: HashMap<String, String>,
    messages: VecDeque<StoredMessage>,
}

impl MemoryQueue {
    fn seconds_attribute(&self, name: &str, default: u64) -> Duration {
        let secs = self
            .attributes
            .get(name)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default);
        Duration::from_secs(secs)
    }

    /// `(maxReceiveCount, deadLetterTargetArn)` of the configured redrive policy.
    fn redrive_policy(&self) -> Option<(u32, String)> {
        let policy: Value = serde_json::from_str(self.attributes.get(ATTR_REDRIVE_POLICY)?).ok()?;
        let max = match &policy["maxReceiveCount"] {
            Value::String(text) => text.parse().ok()?,
            Value::Number(number) => u32::try_from(number.as_u64()?).ok()?,
            _ => return None,
        };
        let target = policy["deadLetterTargetArn"].as_str()?.to_owned();
        Some((max, target))
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Queues by url
    queues: HashMap<String, MemoryQueue>,
    /// Queue urls by ARN
    queue_urls: HashMap<String, String>,
    /// Subscribed queue ARNs by topic ARN
    topics: HashMap<String, Vec<String>>,
    published: Vec<(String, String)>,
}

impl BrokerState {
    fn enqueue(&mut self, queue_url: &str, message_id: &str, body: &str) -> bool {
        let Some(queue) = self.queues.get_mut(queue_url) else {
            return false;
        };
        let visible_at = Instant::now() + queue.seconds_attribute(ATTR_DELAY_SECONDS, 0);
        queue
            .messages
            .push_back(StoredMessage::new(message_id, body, visible_at));
        true
    }

    /// Receives up to `max_messages` visible messages, redriving the ones over
    /// their receive count. Returns the received messages and how many were
    /// moved to the dead-letter queue.
    fn take_visible(
        &mut self,
        queue_url: &str,
        max_messages: usize,
    ) -> Result<(Vec<TransportMessage>, usize), MercuryError> {
        let queue = self
            .queues
            .get(queue_url)
            .ok_or_else(|| MercuryError::PollingError(queue_url.to_owned()))?;

        let redrive = queue.redrive_policy().and_then(|(max, arn)| {
            self.queue_urls
                .get(&arn)
                .filter(|url| url.as_str() != queue_url)
                .map(|url| (max, url.clone()))
        });

        let Some(queue) = self.queues.get_mut(queue_url) else {
            return Ok((Vec::new(), 0));
        };
        let visibility = queue.seconds_attribute(ATTR_VISIBILITY_TIMEOUT, DEFAULT_VISIBILITY_TIMEOUT_SEC);
        let now = Instant::now();

        let mut received = Vec::new();
        let mut dead_lettered = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.messages.len());

        while let Some(mut message) = queue.messages.pop_front() {
            if received.len() >= max_messages || message.visible_at > now {
                kept.push_back(message);
                continue;
            }

            if let Some((max_receive_count, _)) = &redrive {
                if message.receive_count >= *max_receive_count {
                    dead_lettered.push(message);
                    continue;
                }
            }

            let receipt = Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.visible_at = now + visibility;
            message.receipt = Some(receipt.clone());

            received.push(TransportMessage {
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                ack_handle: receipt,
                attributes: HashMap::from([(
                    ATTR_RECEIVE_COUNT.to_owned(),
                    message.receive_count.to_string(),
                )]),
            });
            kept.push_back(message);
        }
        queue.messages = kept;

        let mut redriven = 0;
        if let Some((_, dlq_url)) = redrive {
            for message in dead_lettered {
                if self.enqueue(&dlq_url, &message.message_id, &message.body) {
                    redriven += 1;
                }
            }
        }

        Ok((received, redriven))
    }

    fn next_visible_at(&self, queue_url: &str) -> Option<Instant> {
        self.queues
            .get(queue_url)?
            .messages
            .iter()
            .map(|message| message.visible_at)
            .min()
    }
}

/// In-memory implementation of [`QueueClient`] and [`TopicClient`].
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: RwLock<BrokerState>,
    arrivals: Notify,
    receive_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    /// Url a queue named `name` gets once created.
    pub fn queue_url(name: &str) -> String {
        format!("{QUEUE_URL_PREFIX}{name}")
    }

    /// Enqueues a body directly on a queue, bypassing topics.
    pub async fn send_message(&self, queue_url: &str, body: &str) -> Result<String, MercuryError> {
        let message_id = Uuid::new_v4().to_string();
        let mut state = self.state.write().await;
        if !state.enqueue(queue_url, &message_id, body) {
            return Err(MercuryError::PublishingError(queue_url.to_owned()));
        }
        drop(state);

        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    /// Messages stored on a queue, visible or not.
    pub async fn queue_depth(&self, queue_url: &str) -> usize {
        let state = self.state.read().await;
        state
            .queues
            .get(queue_url)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    pub async fn queue_attributes(&self, queue_url: &str) -> HashMap<String, String> {
        let state = self.state.read().await;
        state
            .queues
            .get(queue_url)
            .map(|queue| queue.attributes.clone())
            .unwrap_or_default()
    }

    /// Whether the topic exists and which queue ARNs are subscribed to it.
    pub async fn topic_subscribers(&self, topic_arn: &str) -> Option<Vec<String>> {
        self.state.read().await.topics.get(topic_arn).cloned()
    }

    /// Bodies published to a topic, in publication order.
    pub async fn published_bodies(&self, topic_arn: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .published
            .iter()
            .filter(|(topic, _)| topic == topic_arn)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::Acquire)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl QueueClient for InMemoryBroker {
    async fn create_queue(&self, name: &str) -> Result<String, MercuryError> {
        let url = Self::queue_url(name);
        let arn = format!("{QUEUE_ARN_PREFIX}{name}");

        let mut state = self.state.write().await;
        state.queue_urls.insert(arn.clone(), url.clone());
        state.queues.entry(url.clone()).or_insert_with(|| MemoryQueue {
            arn,
            ..MemoryQueue::default()
        });
        Ok(url)
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String, MercuryError> {
        let state = self.state.read().await;
        state
            .queues
            .get(queue_url)
            .map(|queue| queue.arn.clone())
            .ok_or_else(|| MercuryError::ProvisioningError(queue_url.to_owned()))
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), MercuryError> {
        let mut state = self.state.write().await;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| MercuryError::ProvisioningError(queue_url.to_owned()))?;
        queue.attributes.extend(attributes);
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<TransportMessage>, MercuryError> {
        self.receive_calls.fetch_add(1, Ordering::AcqRel);
        let deadline = Instant::now() + wait;

        loop {
            let arrival = self.arrivals.notified();

            let mut state = self.state.write().await;
            let (received, redriven) = state.take_visible(queue_url, max_messages)?;
            let done = !received.is_empty() || Instant::now() >= deadline;
            let wake_at = state
                .next_visible_at(queue_url)
                .filter(|at| *at > Instant::now())
                .map_or(deadline, |at| at.min(deadline));
            drop(state);

            // dead-letter queues may be long-polled by another listener
            if redriven > 0 {
                self.arrivals.notify_waiters();
            }
            if done {
                return Ok(received);
            }

            let _ = tokio::time::timeout_at(wake_at, arrival).await;
        }
    }

    async fn delete_message(&self, queue_url: &str, ack_handle: &str) -> Result<(), MercuryError> {
        self.delete_calls.fetch_add(1, Ordering::AcqRel);

        let mut state = self.state.write().await;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| MercuryError::DeletionError(queue_url.to_owned()))?;
        queue
            .messages
            .retain(|message| message.receipt.as_deref() != Some(ack_handle));
        Ok(())
    }
}

#[async_trait]
impl TopicClient for InMemoryBroker {
    async fn create_topic(&self, name: &str) -> Result<String, MercuryError> {
        let arn = format!("{TOPIC_ARN_PREFIX}{name}");
        self.state.write().await.topics.entry(arn.clone()).or_default();
        Ok(arn)
    }

    async fn subscribe_queue(&self, topic_arn: &str, queue_arn: &str) -> Result<String, MercuryError> {
        let mut state = self.state.write().await;
        if !state.queue_urls.contains_key(queue_arn) {
            return Err(MercuryError::ProvisioningError(queue_arn.to_owned()));
        }

        let subscribers = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| MercuryError::ProvisioningError(topic_arn.to_owned()))?;
        if !subscribers.iter().any(|arn| arn == queue_arn) {
            subscribers.push(queue_arn.to_owned());
        }

        Ok(format!("{topic_arn}:{queue_arn}"))
    }

    async fn publish(&self, topic_arn: &str, body: &str) -> Result<String, MercuryError> {
        let message_id = Uuid::new_v4().to_string();

        let mut state = self.state.write().await;
        let subscribers = state
            .topics
            .get(topic_arn)
            .cloned()
            .ok_or_else(|| MercuryError::PublishingError(topic_arn.to_owned()))?;

        state.published.push((topic_arn.to_owned(), body.to_owned()));
        for queue_arn in subscribers {
            if let Some(url) = state.queue_urls.get(&queue_arn).cloned() {
                state.enqueue(&url, &message_id, body);
            }
        }
        drop(state);

        self.arrivals.notify_waiters();
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ATTR_RECEIVE_WAIT_TIME;

    async fn broker_with_queue(name: &str) -> (InMemoryBroker, String) {
        let broker = InMemoryBroker::new();
        let url = broker.create_queue(name).await.unwrap();
        (broker, url)
    }

    #[tokio::test]
    async fn publish_fans_out_to_subscribed_queues() {
        let broker = InMemoryBroker::new();
        let topic = broker.create_topic("app-orders").await.unwrap();
        let a = broker.create_queue("svc-orders-a").await.unwrap();
        let b = broker.create_queue("svc-orders-b").await.unwrap();

        for url in [&a, &b] {
            let arn = broker.queue_arn(url).await.unwrap();
            broker.subscribe_queue(&topic, &arn).await.unwrap();
        }

        broker.publish(&topic, "hello").await.unwrap();

        assert_eq!(broker.queue_depth(&a).await, 1);
        assert_eq!(broker.queue_depth(&b).await, 1);
        assert_eq!(broker.published_bodies(&topic).await, vec!["hello".to_owned()]);
    }

    #[tokio::test]
    async fn received_messages_are_hidden_until_visibility_expires() {
        let (broker, url) = broker_with_queue("q").await;
        broker
            .set_queue_attributes(
                &url,
                HashMap::from([(ATTR_VISIBILITY_TIMEOUT.to_owned(), "0".to_owned())]),
            )
            .await
            .unwrap();
        broker.send_message(&url, "body").await.unwrap();

        let first = broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap();
        let second = broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count(), Some(2));
        assert_ne!(first[0].ack_handle, second[0].ack_handle);
    }

    #[tokio::test]
    async fn default_visibility_hides_received_message() {
        let (broker, url) = broker_with_queue("q").await;
        broker.send_message(&url, "body").await.unwrap();

        assert_eq!(broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap().len(), 1);
        assert!(broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(broker.receive_calls(), 2);
    }

    #[tokio::test]
    async fn receive_is_capped_at_max_messages() {
        let (broker, url) = broker_with_queue("q").await;
        for i in 0..15 {
            broker.send_message(&url, &i.to_string()).await.unwrap();
        }

        let batch = broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].body, "0");
    }

    #[tokio::test]
    async fn delete_removes_message_and_ignores_unknown_handles() {
        let (broker, url) = broker_with_queue("q").await;
        broker.send_message(&url, "body").await.unwrap();
        let received = broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap();

        broker.delete_message(&url, &received[0].ack_handle).await.unwrap();
        broker.delete_message(&url, &received[0].ack_handle).await.unwrap();
        broker.delete_message(&url, "unknown").await.unwrap();

        assert_eq!(broker.queue_depth(&url).await, 0);
        assert_eq!(broker.delete_calls(), 3);
    }

    #[tokio::test]
    async fn over_received_messages_move_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let url = broker.create_queue("q").await.unwrap();
        let dlq = broker.create_queue("q-DLQ").await.unwrap();
        let dlq_arn = broker.queue_arn(&dlq).await.unwrap();
        broker
            .set_queue_attributes(
                &url,
                HashMap::from([
                    (ATTR_VISIBILITY_TIMEOUT.to_owned(), "0".to_owned()),
                    (
                        ATTR_REDRIVE_POLICY.to_owned(),
                        format!(r#"{{"maxReceiveCount":"2","deadLetterTargetArn":"{dlq_arn}"}}"#),
                    ),
                ]),
            )
            .await
            .unwrap();
        broker.send_message(&url, "poison").await.unwrap();

        assert_eq!(broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap().len(), 1);
        assert_eq!(broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap().len(), 1);
        assert!(broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap().is_empty());

        assert_eq!(broker.queue_depth(&url).await, 0);
        let dead = broker.receive_messages(&dlq, 10, Duration::ZERO).await.unwrap();
        assert_eq!(dead[0].body, "poison");
        assert_eq!(dead[0].receive_count(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_waits_for_arrival() {
        let (broker, url) = broker_with_queue("q").await;
        let broker = std::sync::Arc::new(broker);

        let sender = broker.clone();
        let queue = url.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            sender.send_message(&queue, "late").await.unwrap();
        });

        let received = broker
            .receive_messages(&url, 10, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn redrive_wakes_dead_letter_long_poll() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let url = broker.create_queue("q").await.unwrap();
        let dlq = broker.create_queue("q-DLQ").await.unwrap();
        let dlq_arn = broker.queue_arn(&dlq).await.unwrap();
        broker
            .set_queue_attributes(
                &url,
                HashMap::from([
                    (ATTR_VISIBILITY_TIMEOUT.to_owned(), "0".to_owned()),
                    (
                        ATTR_REDRIVE_POLICY.to_owned(),
                        format!(r#"{{"maxReceiveCount":1,"deadLetterTargetArn":"{dlq_arn}"}}"#),
                    ),
                ]),
            )
            .await
            .unwrap();
        broker.send_message(&url, "poison").await.unwrap();
        assert_eq!(broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap().len(), 1);

        let started = Instant::now();
        let waiter = broker.clone();
        let dead_letters = tokio::spawn(async move {
            waiter
                .receive_messages(&dlq, 10, Duration::from_secs(20))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(broker.receive_messages(&url, 10, Duration::ZERO).await.unwrap().is_empty());

        let dead = dead_letters.await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "poison");
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_returns_empty_after_wait() {
        let (broker, url) = broker_with_queue("q").await;
        let started = Instant::now();

        let received = broker
            .receive_messages(&url, 10, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(received.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unknown_resources_are_errors() {
        let broker = InMemoryBroker::new();

        assert!(matches!(
            broker.receive_messages("memory://queues/none", 10, Duration::ZERO).await,
            Err(MercuryError::PollingError(_))
        ));
        assert!(matches!(
            broker.publish("arn:memory:topic:none", "x").await,
            Err(MercuryError::PublishingError(_))
        ));
        assert!(matches!(
            broker.set_queue_attributes(
                "memory://queues/none",
                HashMap::from([(ATTR_RECEIVE_WAIT_TIME.to_owned(), "1".to_owned())])
            )
            .await,
            Err(MercuryError::ProvisioningError(_))
        ));
    }
}
