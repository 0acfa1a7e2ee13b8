// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Subscription Configuration
//!
//! This module provides the configuration model for subscription queues and
//! their dead-letter queues: polling cadence, visibility timeout, long-poll
//! wait, delivery delay and the maximum delivery attempts after which the
//! backend moves a message to the dead-letter queue.
//!
//! The types implement the builder pattern and can also be deserialized from
//! configuration files.

use crate::{errors::MercuryError, subscription::SubscriptionId};
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::HashMap, time::Duration};

/// Backend attribute: seconds a received message stays hidden
pub const ATTR_VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
/// Backend attribute: long-poll wait in seconds
pub const ATTR_RECEIVE_WAIT_TIME: &str = "ReceiveMessageWaitTimeSeconds";
/// Backend attribute: delivery delay in seconds
pub const ATTR_DELAY_SECONDS: &str = "DelaySeconds";
/// Backend attribute: JSON-encoded redrive policy
pub const ATTR_REDRIVE_POLICY: &str = "RedrivePolicy";
/// Backend attribute: queue ARN
pub const ATTR_QUEUE_ARN: &str = "QueueArn";

/// Largest batch a single receive call may return
pub const MAX_BATCH_SIZE: usize = 10;

const MIN_POLLING_INTERVAL_MS: u64 = 100;
const MAX_VISIBILITY_TIMEOUT_SEC: u32 = 43_200;
const MAX_LONG_POLL_WAIT_SEC: u32 = 20;
const MAX_DELAY_SEC: u32 = 900;
const MAX_DELIVERY_ATTEMPTS: u32 = 100;

/// Polling and processing parameters of one backend queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub(crate) polling_interval_ms: u64,
    pub(crate) visibility_timeout_sec: u32,
    pub(crate) long_poll_wait_sec: u32,
    pub(crate) delay_sec: u32,
}

impl Default for QueueConfig {
    /// Defaults for a subscription queue: poll every 5s, 30s visibility, 20s long poll.
    fn default() -> Self {
        QueueConfig {
            polling_interval_ms: 5_000,
            visibility_timeout_sec: 30,
            long_poll_wait_sec: 20,
            delay_sec: 0,
        }
    }
}

impl QueueConfig {
    /// Defaults for a dead-letter queue: poll every 5s, 60s visibility, 20s long poll.
    pub fn dead_letter_defaults() -> QueueConfig {
        QueueConfig {
            visibility_timeout_sec: 60,
            ..QueueConfig::default()
        }
    }

    /// Sets the delay between the end of one poll and the start of the next.
    pub fn polling_interval_ms(mut self, ms: u64) -> Self {
        self.polling_interval_ms = ms;
        self
    }

    /// Sets how long a received message stays hidden from other receivers.
    pub fn visibility_timeout_sec(mut self, sec: u32) -> Self {
        self.visibility_timeout_sec = sec;
        self
    }

    /// Sets the server-side long-poll wait. Zero means short polling.
    pub fn long_poll_wait_sec(mut self, sec: u32) -> Self {
        self.long_poll_wait_sec = sec;
        self
    }

    /// Sets the delay before new messages become visible.
    pub fn delay_sec(mut self, sec: u32) -> Self {
        self.delay_sec = sec;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn long_poll_wait(&self) -> Duration {
        Duration::from_secs(u64::from(self.long_poll_wait_sec))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_timeout_sec))
    }

    /// Checks every value against its allowed range.
    pub fn validate(&self) -> Result<(), MercuryError> {
        if self.polling_interval_ms < MIN_POLLING_INTERVAL_MS {
            return Err(MercuryError::InvalidConfiguration(format!(
                "polling_interval_ms must be at least {MIN_POLLING_INTERVAL_MS}, got {}",
                self.polling_interval_ms
            )));
        }
        if self.visibility_timeout_sec > MAX_VISIBILITY_TIMEOUT_SEC {
            return Err(MercuryError::InvalidConfiguration(format!(
                "visibility_timeout_sec must be at most {MAX_VISIBILITY_TIMEOUT_SEC}, got {}",
                self.visibility_timeout_sec
            )));
        }
        if self.long_poll_wait_sec > MAX_LONG_POLL_WAIT_SEC {
            return Err(MercuryError::InvalidConfiguration(format!(
                "long_poll_wait_sec must be at most {MAX_LONG_POLL_WAIT_SEC}, got {}",
                self.long_poll_wait_sec
            )));
        }
        if self.delay_sec > MAX_DELAY_SEC {
            return Err(MercuryError::InvalidConfiguration(format!(
                "delay_sec must be at most {MAX_DELAY_SEC}, got {}",
                self.delay_sec
            )));
        }
        Ok(())
    }

    /// Backend queue attributes derived from this configuration.
    pub fn as_queue_attributes(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                ATTR_VISIBILITY_TIMEOUT.to_owned(),
                self.visibility_timeout_sec.to_string(),
            ),
            (
                ATTR_RECEIVE_WAIT_TIME.to_owned(),
                self.long_poll_wait_sec.to_string(),
            ),
            (ATTR_DELAY_SECONDS.to_owned(), self.delay_sec.to_string()),
        ])
    }
}

/// Dead-letter queue configuration of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub(crate) enabled: bool,
    #[serde(
        default = "QueueConfig::dead_letter_defaults",
        deserialize_with = "dead_letter_queue"
    )]
    pub(crate) queue: QueueConfig,
}

/// A `dlq.queue` block where every value is optional.
#[derive(Deserialize)]
struct DeadLetterQueueOverrides {
    polling_interval_ms: Option<u64>,
    visibility_timeout_sec: Option<u32>,
    long_poll_wait_sec: Option<u32>,
    delay_sec: Option<u32>,
}

/// Fills the values missing from a `dlq.queue` block with the dead-letter defaults.
fn dead_letter_queue<'de, D: Deserializer<'de>>(deserializer: D) -> Result<QueueConfig, D::Error> {
    let overrides = DeadLetterQueueOverrides::deserialize(deserializer)?;
    let defaults = QueueConfig::dead_letter_defaults();

    Ok(QueueConfig {
        polling_interval_ms: overrides
            .polling_interval_ms
            .unwrap_or(defaults.polling_interval_ms),
        visibility_timeout_sec: overrides
            .visibility_timeout_sec
            .unwrap_or(defaults.visibility_timeout_sec),
        long_poll_wait_sec: overrides
            .long_poll_wait_sec
            .unwrap_or(defaults.long_poll_wait_sec),
        delay_sec: overrides.delay_sec.unwrap_or(defaults.delay_sec),
    })
}

impl Default for DlqConfig {
    fn default() -> Self {
        DlqConfig {
            enabled: true,
            queue: QueueConfig::dead_letter_defaults(),
        }
    }
}

impl DlqConfig {
    /// A DLQ configuration that provisions and polls no dead-letter queue.
    pub fn disabled() -> DlqConfig {
        DlqConfig {
            enabled: false,
            ..DlqConfig::default()
        }
    }

    /// Replaces the polling parameters of the dead-letter queue.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue
    }
}

/// Redrive policy stored on the main queue, pointing to its dead-letter queue.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RedrivePolicy<'a> {
    max_receive_count: String,
    dead_letter_target_arn: &'a str,
}

/// Configuration of one topic subscription.
///
/// `max_delivery_attempts` and the dead-letter target are applied to the
/// backend queue as a redrive policy; the backend tracks receive counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    #[serde(flatten)]
    pub(crate) id: SubscriptionId,
    pub(crate) queue: QueueConfig,
    pub(crate) max_delivery_attempts: u32,
    pub(crate) dlq: DlqConfig,
    pub(crate) create_topic_automatically: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig::new(SubscriptionId::for_topic(""))
    }
}

impl SubscriptionConfig {
    /// Creates a subscription configuration with default queue settings,
    /// five delivery attempts, an enabled DLQ and automatic topic creation.
    pub fn new(id: SubscriptionId) -> SubscriptionConfig {
        SubscriptionConfig {
            id,
            queue: QueueConfig::default(),
            max_delivery_attempts: 5,
            dlq: DlqConfig::default(),
            create_topic_automatically: true,
        }
    }

    /// Replaces the polling parameters of the subscription queue.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the number of failed receives after which a message is dead-lettered.
    pub fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn dlq(mut self, dlq: DlqConfig) -> Self {
        self.dlq = dlq;
        self
    }

    pub fn without_dlq(mut self) -> Self {
        self.dlq = DlqConfig::disabled();
        self
    }

    /// Provision only the queue, for queues populated by something other than
    /// a Mercury topic.
    pub fn without_topic_creation(mut self) -> Self {
        self.create_topic_automatically = false;
        self
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue
    }

    pub fn dlq_config(&self) -> &DlqConfig {
        &self.dlq
    }

    pub fn max_delivery_attempt_count(&self) -> u32 {
        self.max_delivery_attempts
    }

    pub fn creates_topic(&self) -> bool {
        self.create_topic_automatically
    }

    /// Checks the subscription, its queue and (if enabled) its DLQ.
    pub fn validate(&self) -> Result<(), MercuryError> {
        if self.id.topic_name().trim().is_empty() {
            return Err(MercuryError::InvalidConfiguration(
                "subscription topic_name must not be empty".to_owned(),
            ));
        }
        if !(1..=MAX_DELIVERY_ATTEMPTS).contains(&self.max_delivery_attempts) {
            return Err(MercuryError::InvalidConfiguration(format!(
                "max_delivery_attempts of `{}` must be within 1..={MAX_DELIVERY_ATTEMPTS}, got {}",
                self.id, self.max_delivery_attempts
            )));
        }
        self.queue.validate()?;
        if self.dlq.enabled {
            self.dlq.queue.validate()?;
        }
        Ok(())
    }

    /// JSON redrive policy routing over-attempted messages to `dlq_arn`.
    pub fn redrive_policy(&self, dlq_arn: &str) -> Result<String, MercuryError> {
        serde_json::to_string(&RedrivePolicy {
            max_receive_count: self.max_delivery_attempts.to_string(),
            dead_letter_target_arn: dlq_arn,
        })
        .map_err(|err| MercuryError::InvalidConfiguration(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_subscription_and_dlq_cadence() {
        let cfg = SubscriptionConfig::new(SubscriptionId::for_topic("orders"));

        assert_eq!(cfg.queue.polling_interval_ms, 5_000);
        assert_eq!(cfg.queue.visibility_timeout_sec, 30);
        assert_eq!(cfg.queue.long_poll_wait_sec, 20);
        assert_eq!(cfg.max_delivery_attempts, 5);
        assert!(cfg.dlq.is_enabled());
        assert_eq!(cfg.dlq.queue.visibility_timeout_sec, 60);
        assert!(cfg.creates_topic());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let id = SubscriptionId::for_topic("orders");

        let too_fast = SubscriptionConfig::new(id.clone())
            .queue(QueueConfig::default().polling_interval_ms(99));
        assert!(matches!(
            too_fast.validate(),
            Err(MercuryError::InvalidConfiguration(_))
        ));

        let long_wait = QueueConfig::default().long_poll_wait_sec(21);
        assert!(long_wait.validate().is_err());

        let long_visibility = QueueConfig::default().visibility_timeout_sec(43_201);
        assert!(long_visibility.validate().is_err());

        let long_delay = QueueConfig::default().delay_sec(901);
        assert!(long_delay.validate().is_err());

        let attempts = SubscriptionConfig::new(id.clone()).max_delivery_attempts(0);
        assert!(attempts.validate().is_err());
        let attempts = SubscriptionConfig::new(id).max_delivery_attempts(101);
        assert!(attempts.validate().is_err());

        let no_topic = SubscriptionConfig::default();
        assert!(no_topic.validate().is_err());
    }

    #[test]
    fn disabled_dlq_is_not_validated() {
        let cfg = SubscriptionConfig::new(SubscriptionId::for_topic("orders")).dlq(
            DlqConfig::disabled().queue(QueueConfig::default().polling_interval_ms(1)),
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn queue_attributes_are_stringified() {
        let attrs = QueueConfig::default()
            .visibility_timeout_sec(45)
            .long_poll_wait_sec(0)
            .delay_sec(3)
            .as_queue_attributes();

        assert_eq!(attrs.get(ATTR_VISIBILITY_TIMEOUT).map(String::as_str), Some("45"));
        assert_eq!(attrs.get(ATTR_RECEIVE_WAIT_TIME).map(String::as_str), Some("0"));
        assert_eq!(attrs.get(ATTR_DELAY_SECONDS).map(String::as_str), Some("3"));
    }

    #[test]
    fn redrive_policy_references_dlq() {
        let cfg = SubscriptionConfig::new(SubscriptionId::for_topic("orders"))
            .max_delivery_attempts(7);
        let policy = cfg.redrive_policy("arn:aws:sqs:dlq").unwrap();

        let value: serde_json::Value = serde_json::from_str(&policy).unwrap();
        assert_eq!(value["maxReceiveCount"], "7");
        assert_eq!(value["deadLetterTargetArn"], "arn:aws:sqs:dlq");
    }

    #[test]
    fn partial_dlq_queue_keeps_dead_letter_defaults() {
        let dlq: DlqConfig =
            serde_json::from_str(r#"{"queue":{"polling_interval_ms":200}}"#).unwrap();

        assert!(dlq.is_enabled());
        assert_eq!(dlq.queue.polling_interval_ms, 200);
        assert_eq!(dlq.queue.visibility_timeout_sec, 60);
        assert_eq!(dlq.queue.long_poll_wait_sec, 20);

        let defaults: DlqConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, DlqConfig::default());
    }

    #[test]
    fn subscription_deserializes_with_defaults() {
        let cfg: SubscriptionConfig = serde_json::from_str(
            r#"{"topic_name":"orders","queue_name":"audit","max_delivery_attempts":3}"#,
        )
        .unwrap();

        assert_eq!(cfg.id(), &SubscriptionId::for_topic_with_queue("orders", "audit"));
        assert_eq!(cfg.max_delivery_attempts, 3);
        assert_eq!(cfg.queue, QueueConfig::default());
        assert_eq!(cfg.dlq, DlqConfig::default());
    }
}
