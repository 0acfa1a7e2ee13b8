// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Topology
//!
//! Provisions the backend resources every configured subscription needs
//! before its listeners start:
//! - the subscription queue, with its polling attributes
//! - the topic, subscribed to the queue, when automatic creation is enabled
//! - the dead-letter queue and the main queue's redrive policy, when enabled
//!
//! Every backend call is idempotent, so installing an existing topology again
//! only reapplies its attributes.

use crate::{
    backend::{QueueClient, TopicClient},
    config::ConsumerConfig,
    errors::MercuryError,
    queue::{SubscriptionConfig, ATTR_REDRIVE_POLICY},
    subscription::topic_name,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

/// Backend references of one provisioned subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedSubscription {
    pub config: SubscriptionConfig,
    pub queue_url: String,
    /// Set when the dead-letter queue is enabled
    pub dlq_url: Option<String>,
}

pub struct Topology {
    queue_client: Arc<dyn QueueClient>,
    topic_client: Arc<dyn TopicClient>,
}

impl Topology {
    pub fn new(queue_client: Arc<dyn QueueClient>, topic_client: Arc<dyn TopicClient>) -> Topology {
        Topology {
            queue_client,
            topic_client,
        }
    }

    /// Provisions every subscription of `consumer`.
    ///
    /// The whole configuration is validated first; a duplicate subscription id
    /// or an out-of-range setting fails before any backend call is made.
    pub async fn install(
        &self,
        consumer: &ConsumerConfig,
        topic_names_prefix: &str,
    ) -> Result<Vec<ProvisionedSubscription>, MercuryError> {
        consumer.validate()?;

        let mut provisioned = Vec::with_capacity(consumer.subscriptions.len());
        for subscription in &consumer.subscriptions {
            provisioned.push(
                self.install_subscription(subscription, &consumer.queue_names_prefix, topic_names_prefix)
                    .await?,
            );
        }

        Ok(provisioned)
    }

    async fn install_subscription(
        &self,
        subscription: &SubscriptionConfig,
        queue_names_prefix: &str,
        topic_names_prefix: &str,
    ) -> Result<ProvisionedSubscription, MercuryError> {
        let id = subscription.id();

        let queue_url = self
            .queue_client
            .create_queue(&id.queue_name(queue_names_prefix))
            .await?;
        self.queue_client
            .set_queue_attributes(&queue_url, subscription.queue_config().as_queue_attributes())
            .await?;

        if subscription.creates_topic() {
            let topic_arn = self
                .topic_client
                .create_topic(&topic_name(topic_names_prefix, id.topic_name()))
                .await?;
            let queue_arn = self.queue_client.queue_arn(&queue_url).await?;
            let subscription_arn = self
                .topic_client
                .subscribe_queue(&topic_arn, &queue_arn)
                .await?;

            info!(
                subscription = %id,
                %topic_arn,
                %queue_url,
                %subscription_arn,
                "topic prepared for consuming"
            );
        } else {
            info!(subscription = %id, %queue_url, "queue prepared for consuming");
        }

        let dlq_config = subscription.dlq_config();
        if !dlq_config.is_enabled() {
            debug!(subscription = %id, "dead-letter queue disabled");
            return Ok(ProvisionedSubscription {
                config: subscription.clone(),
                queue_url,
                dlq_url: None,
            });
        }

        let dlq_url = self
            .queue_client
            .create_queue(&id.dlq_name(queue_names_prefix))
            .await?;
        self.queue_client
            .set_queue_attributes(&dlq_url, dlq_config.queue_config().as_queue_attributes())
            .await?;

        let dlq_arn = self.queue_client.queue_arn(&dlq_url).await?;
        let policy = subscription.redrive_policy(&dlq_arn)?;
        self.queue_client
            .set_queue_attributes(
                &queue_url,
                HashMap::from([(ATTR_REDRIVE_POLICY.to_owned(), policy)]),
            )
            .await?;

        info!(subscription = %id, %dlq_url, "dead-letter queue configured");

        Ok(ProvisionedSubscription {
            config: subscription.clone(),
            queue_url,
            dlq_url: Some(dlq_url),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MockQueueClient, MockTopicClient},
        memory::InMemoryBroker,
        queue::{DlqConfig, QueueConfig, ATTR_VISIBILITY_TIMEOUT},
        subscription::SubscriptionId,
    };
    use serde_json::Value;

    fn in_memory() -> (Arc<InMemoryBroker>, Topology) {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = Topology::new(broker.clone(), broker.clone());
        (broker, topology)
    }

    #[tokio::test]
    async fn provisions_queue_topic_and_dead_letter_queue() {
        let (broker, topology) = in_memory();
        let consumer = ConsumerConfig::new("billing").subscription(
            SubscriptionConfig::new(SubscriptionId::for_topic("orders"))
                .queue(QueueConfig::default().visibility_timeout_sec(45))
                .max_delivery_attempts(3),
        );

        let provisioned = topology.install(&consumer, "prod").await.unwrap();

        assert_eq!(provisioned.len(), 1);
        let subscription = &provisioned[0];
        assert_eq!(subscription.queue_url, InMemoryBroker::queue_url("billing-orders"));
        assert_eq!(
            subscription.dlq_url.as_deref(),
            Some(InMemoryBroker::queue_url("billing-orders-DLQ").as_str())
        );

        let attributes = broker.queue_attributes(&subscription.queue_url).await;
        assert_eq!(attributes[ATTR_VISIBILITY_TIMEOUT], "45");
        let policy: Value = serde_json::from_str(&attributes[ATTR_REDRIVE_POLICY]).unwrap();
        assert_eq!(policy["maxReceiveCount"], "3");
        assert_eq!(policy["deadLetterTargetArn"], "arn:memory:queue:billing-orders-DLQ");

        let dlq_attributes = broker
            .queue_attributes(subscription.dlq_url.as_deref().unwrap())
            .await;
        assert_eq!(dlq_attributes[ATTR_VISIBILITY_TIMEOUT], "60");

        let subscribers = broker.topic_subscribers("arn:memory:topic:prod-orders").await;
        assert_eq!(subscribers, Some(vec!["arn:memory:queue:billing-orders".to_owned()]));
    }

    #[tokio::test]
    async fn installing_twice_is_idempotent() {
        let (broker, topology) = in_memory();
        let consumer = ConsumerConfig::new("billing")
            .subscription(SubscriptionConfig::new(SubscriptionId::for_topic("orders")));

        let first = topology.install(&consumer, "prod").await.unwrap();
        let second = topology.install(&consumer, "prod").await.unwrap();

        assert_eq!(first, second);
        let subscribers = broker.topic_subscribers("arn:memory:topic:prod-orders").await;
        assert_eq!(subscribers.map(|s| s.len()), Some(1));
    }

    #[tokio::test]
    async fn duplicate_subscriptions_make_no_backend_calls() {
        let topology = Topology::new(
            Arc::new(MockQueueClient::new()),
            Arc::new(MockTopicClient::new()),
        );
        let consumer = ConsumerConfig::new("billing")
            .subscription(SubscriptionConfig::new(SubscriptionId::for_topic_with_queue(
                "orders", "a",
            )))
            .subscription(SubscriptionConfig::new(SubscriptionId::for_topic_with_queue(
                "orders", "a",
            )));

        assert_eq!(
            topology.install(&consumer, "prod").await,
            Err(MercuryError::DuplicateSubscription("orders-a".to_owned()))
        );
    }

    #[tokio::test]
    async fn skips_topic_and_dead_letter_queue_when_disabled() {
        let mut queue_client = MockQueueClient::new();
        queue_client
            .expect_create_queue()
            .withf(|name| name == "billing-orders")
            .times(1)
            .returning(|name| Ok(format!("url://{name}")));
        queue_client
            .expect_set_queue_attributes()
            .withf(|url, attributes| {
                url == "url://billing-orders" && !attributes.contains_key(ATTR_REDRIVE_POLICY)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        queue_client.expect_queue_arn().times(0);

        let mut topic_client = MockTopicClient::new();
        topic_client.expect_create_topic().times(0);
        topic_client.expect_subscribe_queue().times(0);

        let topology = Topology::new(Arc::new(queue_client), Arc::new(topic_client));
        let consumer = ConsumerConfig::new("billing").subscription(
            SubscriptionConfig::new(SubscriptionId::for_topic("orders"))
                .without_topic_creation()
                .dlq(DlqConfig::disabled()),
        );

        let provisioned = topology.install(&consumer, "prod").await.unwrap();
        assert_eq!(provisioned[0].dlq_url, None);
    }

    #[tokio::test]
    async fn backend_failures_propagate() {
        let mut queue_client = MockQueueClient::new();
        queue_client
            .expect_create_queue()
            .returning(|name| Err(MercuryError::ProvisioningError(name.to_owned())));

        let topology = Topology::new(Arc::new(queue_client), Arc::new(MockTopicClient::new()));
        let consumer = ConsumerConfig::new("billing")
            .subscription(SubscriptionConfig::new(SubscriptionId::for_topic("orders")));

        assert_eq!(
            topology.install(&consumer, "prod").await,
            Err(MercuryError::ProvisioningError("billing-orders".to_owned()))
        );
    }
}
