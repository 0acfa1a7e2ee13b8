// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Identity and Naming
//!
//! A subscription is one backend queue bound to one topic within an
//! application. This module defines its identity and the naming convention
//! used to derive backend queue and topic names from it.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// Delimiter between name segments of queues and topics
pub const NAME_DELIMITER: &str = "-";
/// Postfix appended to a subscription queue name to form its dead-letter queue
pub const DLQ_NAME_POSTFIX: &str = "DLQ";

/// Unique identifier of a subscription within a single application.
///
/// It consists of the topic name and an optional queue discriminator. Two
/// subscriptions to the same topic must use distinct discriminators. Equality
/// and hashing are based on the string form `topic[-discriminator]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionId {
    topic_name: String,
    #[serde(default, rename = "queue_name")]
    discriminator: Option<String>,
}

impl SubscriptionId {
    /// Creates an identity for the only subscription to a topic.
    pub fn for_topic(topic_name: &str) -> SubscriptionId {
        SubscriptionId {
            topic_name: topic_name.to_owned(),
            discriminator: None,
        }
    }

    /// Creates an identity distinguished from other subscriptions to the same topic.
    pub fn for_topic_with_queue(topic_name: &str, discriminator: &str) -> SubscriptionId {
        SubscriptionId {
            topic_name: topic_name.to_owned(),
            discriminator: Some(discriminator.to_owned()),
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref().filter(|d| !d.is_empty())
    }

    /// Full backend queue name: `{prefix}-{topic}[-{discriminator}]`.
    pub fn queue_name(&self, queue_names_prefix: &str) -> String {
        format!("{queue_names_prefix}{NAME_DELIMITER}{self}")
    }

    /// Full backend dead-letter queue name: the queue name with `-DLQ` appended.
    pub fn dlq_name(&self, queue_names_prefix: &str) -> String {
        format!(
            "{}{NAME_DELIMITER}{DLQ_NAME_POSTFIX}",
            self.queue_name(queue_names_prefix)
        )
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.discriminator() {
            Some(d) => write!(f, "{}{NAME_DELIMITER}{}", self.topic_name, d),
            None => f.write_str(&self.topic_name),
        }
    }
}

impl PartialEq for SubscriptionId {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for SubscriptionId {}

impl Hash for SubscriptionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

/// Full backend topic name: `{prefix}-{topic}`.
pub fn topic_name(topic_names_prefix: &str, topic: &str) -> String {
    format!("{topic_names_prefix}{NAME_DELIMITER}{topic}")
}

/// Which of a subscription's two queues a listener or consumer is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueueKind {
    #[default]
    Main,
    DeadLetter,
}

impl QueueKind {
    pub fn is_dead_letter(self) -> bool {
        self == QueueKind::DeadLetter
    }

    /// Label used in logs: the subscription id, with `-DLQ` for dead-letter queues.
    pub fn label(self, id: &SubscriptionId) -> String {
        match self {
            QueueKind::Main => id.to_string(),
            QueueKind::DeadLetter => format!("{id}{NAME_DELIMITER}{DLQ_NAME_POSTFIX}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn queue_names_follow_convention() {
        let id = SubscriptionId::for_topic("orders");
        assert_eq!(id.queue_name("prod-billing"), "prod-billing-orders");
        assert_eq!(id.dlq_name("prod-billing"), "prod-billing-orders-DLQ");

        let id = SubscriptionId::for_topic_with_queue("orders", "audit");
        assert_eq!(id.queue_name("prod-billing"), "prod-billing-orders-audit");
        assert_eq!(id.dlq_name("prod-billing"), "prod-billing-orders-audit-DLQ");
    }

    #[test]
    fn topic_name_is_prefixed() {
        assert_eq!(topic_name("prod", "orders"), "prod-orders");
    }

    #[test]
    fn identity_is_based_on_string_form() {
        let a = SubscriptionId::for_topic_with_queue("orders", "a");
        let b = SubscriptionId::for_topic_with_queue("orders", "b");
        let empty = SubscriptionId::for_topic_with_queue("orders", "");

        assert_ne!(a, b);
        assert_eq!(empty, SubscriptionId::for_topic("orders"));

        let set: HashSet<_> = [a.clone(), b, a].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn dead_letter_label_has_postfix() {
        let id = SubscriptionId::for_topic("orders");
        assert_eq!(QueueKind::Main.label(&id), "orders");
        assert_eq!(QueueKind::DeadLetter.label(&id), "orders-DLQ");
    }
}
