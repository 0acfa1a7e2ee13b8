// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # SNS/SQS Backend
//!
//! Implements the queue and topic collaborators on top of AWS SNS and SQS.
//! Queues subscribed to a topic receive raw envelopes, and a queue policy
//! allowing the topic to send to the queue is set on subscription.

use crate::{
    backend::{QueueClient, TopicClient, TransportMessage, ATTR_RECEIVE_COUNT},
    config::BackendConfig,
    errors::MercuryError,
    queue::{ATTR_QUEUE_ARN, MAX_BATCH_SIZE},
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::{error::DisplayErrorContext as SnsErrorContext, Client as SnsClient};
use aws_sdk_sqs::{
    error::DisplayErrorContext as SqsErrorContext,
    types::{MessageSystemAttributeName, QueueAttributeName},
    Client as SqsClient,
};
use serde_json::json;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, error, info};

const ATTR_POLICY: &str = "Policy";
const ATTR_RAW_MESSAGE_DELIVERY: &str = "RawMessageDelivery";
const MAX_WAIT_SEC: u64 = 20;

pub struct SnsSqsBackend {
    sns: SnsClient,
    sqs: SqsClient,
}

impl SnsSqsBackend {
    /// Loads AWS settings from the default provider chain, overridden by `cfg`.
    pub async fn connect(cfg: &BackendConfig) -> SnsSqsBackend {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &cfg.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &cfg.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        info!(region = ?cfg.region, endpoint = ?cfg.endpoint_url, "sns/sqs clients created");

        SnsSqsBackend::new(SnsClient::new(&sdk_config), SqsClient::new(&sdk_config))
    }

    pub fn new(sns: SnsClient, sqs: SqsClient) -> SnsSqsBackend {
        SnsSqsBackend { sns, sqs }
    }

    async fn allow_topic(&self, topic_arn: &str, queue_arn: &str) -> Result<(), MercuryError> {
        let queue_name = queue_arn.rsplit(':').next().unwrap_or(queue_arn);
        let queue_url = match self.sqs.get_queue_url().queue_name(queue_name).send().await {
            Ok(output) => output.queue_url().map(str::to_owned),
            Err(err) => {
                error!(error = %SqsErrorContext(&err), queue_arn, "failure to resolve queue url");
                None
            }
        }
        .ok_or_else(|| MercuryError::ProvisioningError(queue_arn.to_owned()))?;

        let policy = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "sns.amazonaws.com" },
                "Action": "sqs:SendMessage",
                "Resource": queue_arn,
                "Condition": { "ArnEquals": { "aws:SourceArn": topic_arn } }
            }]
        });

        self.set_queue_attributes(
            &queue_url,
            HashMap::from([(ATTR_POLICY.to_owned(), policy.to_string())]),
        )
        .await
    }
}

#[async_trait]
impl QueueClient for SnsSqsBackend {
    async fn create_queue(&self, name: &str) -> Result<String, MercuryError> {
        match self.sqs.create_queue().queue_name(name).send().await {
            Ok(output) => output
                .queue_url()
                .map(str::to_owned)
                .ok_or_else(|| MercuryError::ProvisioningError(name.to_owned())),
            Err(err) => {
                error!(error = %SqsErrorContext(&err), queue = name, "failure to create queue");
                Err(MercuryError::ProvisioningError(name.to_owned()))
            }
        }
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String, MercuryError> {
        let output = match self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::from(ATTR_QUEUE_ARN))
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                error!(error = %SqsErrorContext(&err), queue_url, "failure to read queue arn");
                return Err(MercuryError::ProvisioningError(queue_url.to_owned()));
            }
        };

        output
            .attributes()
            .and_then(|attributes| attributes.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| MercuryError::ProvisioningError(queue_url.to_owned()))
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), MercuryError> {
        let attributes = attributes
            .into_iter()
            .map(|(name, value)| (QueueAttributeName::from(name.as_str()), value))
            .collect();

        match self
            .sqs
            .set_queue_attributes()
            .queue_url(queue_url)
            .set_attributes(Some(attributes))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = %SqsErrorContext(&err), queue_url, "failure to set queue attributes");
                Err(MercuryError::ProvisioningError(queue_url.to_owned()))
            }
        }
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<TransportMessage>, MercuryError> {
        let max_messages = i32::try_from(max_messages.clamp(1, MAX_BATCH_SIZE)).unwrap_or(1);
        let wait_sec = i32::try_from(wait.as_secs().min(MAX_WAIT_SEC)).unwrap_or(0);

        let output = match self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_sec)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                error!(error = %SqsErrorContext(&err), queue_url, "failure to receive messages");
                return Err(MercuryError::PollingError(queue_url.to_owned()));
            }
        };

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let (Some(body), Some(ack_handle)) = (message.body(), message.receipt_handle())
                else {
                    debug!(queue_url, "skipping message without body or receipt handle");
                    return None;
                };

                let attributes = message
                    .attributes()
                    .and_then(|attributes| {
                        attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount)
                    })
                    .map(|count| HashMap::from([(ATTR_RECEIVE_COUNT.to_owned(), count.clone())]))
                    .unwrap_or_default();

                Some(TransportMessage {
                    message_id: message.message_id().unwrap_or_default().to_owned(),
                    body: body.to_owned(),
                    ack_handle: ack_handle.to_owned(),
                    attributes,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete_message(&self, queue_url: &str, ack_handle: &str) -> Result<(), MercuryError> {
        match self
            .sqs
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(ack_handle)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = %SqsErrorContext(&err), queue_url, "failure to delete message");
                Err(MercuryError::DeletionError(queue_url.to_owned()))
            }
        }
    }
}

#[async_trait]
impl TopicClient for SnsSqsBackend {
    async fn create_topic(&self, name: &str) -> Result<String, MercuryError> {
        match self.sns.create_topic().name(name).send().await {
            Ok(output) => output
                .topic_arn()
                .map(str::to_owned)
                .ok_or_else(|| MercuryError::ProvisioningError(name.to_owned())),
            Err(err) => {
                error!(error = %SnsErrorContext(&err), topic = name, "failure to create topic");
                Err(MercuryError::ProvisioningError(name.to_owned()))
            }
        }
    }

    async fn subscribe_queue(&self, topic_arn: &str, queue_arn: &str) -> Result<String, MercuryError> {
        self.allow_topic(topic_arn, queue_arn).await?;

        match self
            .sns
            .subscribe()
            .topic_arn(topic_arn)
            .protocol("sqs")
            .endpoint(queue_arn)
            .attributes(ATTR_RAW_MESSAGE_DELIVERY, "true")
            .return_subscription_arn(true)
            .send()
            .await
        {
            Ok(output) => Ok(output.subscription_arn().unwrap_or_default().to_owned()),
            Err(err) => {
                error!(
                    error = %SnsErrorContext(&err),
                    topic_arn,
                    queue_arn,
                    "failure to subscribe queue"
                );
                Err(MercuryError::ProvisioningError(topic_arn.to_owned()))
            }
        }
    }

    async fn publish(&self, topic_arn: &str, body: &str) -> Result<String, MercuryError> {
        match self.sns.publish().topic_arn(topic_arn).message(body).send().await {
            Ok(output) => Ok(output.message_id().unwrap_or_default().to_owned()),
            Err(err) => {
                error!(error = %SnsErrorContext(&err), topic_arn, "failure to publish");
                Err(MercuryError::PublishingError(topic_arn.to_owned()))
            }
        }
    }
}
