// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listeners Runner
//!
//! Provisions the configured subscriptions and schedules one listener per
//! subscription queue, plus one per dead-letter queue when it is enabled.
//!
//! Each listener runs on its own task with fixed-delay scheduling: the next
//! poll starts one polling interval after the previous poll completed, so a
//! listener never overlaps with itself and slow polls throttle naturally.
//! Consumption runs on the shared [`ConsumptionExecutor`].

use crate::{
    backend::{QueueClient, TopicClient},
    config::{ConsumerConfig, MercuryConfig},
    consumer::{Consumption, QueueTarget},
    errors::MercuryError,
    executor::ConsumptionExecutor,
    listener::TopicQueueListener,
    metrics::{ConsumerMetrics, NoopConsumerMetrics},
    otel::TRACER_NAME,
    registry::ConsumerRegistry,
    subscription::QueueKind,
    topology::Topology,
};
use futures_util::future::join_all;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{error, info};

pub struct ListenersRunnerBuilder {
    registry: Arc<ConsumerRegistry>,
    queue_client: Arc<dyn QueueClient>,
    topic_client: Arc<dyn TopicClient>,
    consumer: ConsumerConfig,
    topic_names_prefix: String,
    metrics: Arc<dyn ConsumerMetrics>,
    executor: Option<ConsumptionExecutor>,
}

impl ListenersRunnerBuilder {
    pub fn consumer_config(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Prefix of the topics subscriptions are bound to, shared with publishers.
    pub fn topic_names_prefix(mut self, prefix: &str) -> Self {
        self.topic_names_prefix = prefix.to_owned();
        self
    }

    /// Takes the consumer config and the publishers' topic prefix from `cfg`.
    pub fn config(self, cfg: &MercuryConfig) -> Self {
        self.consumer_config(cfg.consumer.clone())
            .topic_names_prefix(&cfg.publisher.topic_names_prefix)
    }

    pub fn metrics(mut self, metrics: Arc<dyn ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Overrides the executor otherwise built from the consumer config.
    pub fn executor(mut self, executor: ConsumptionExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Provisions every subscription and starts its listeners.
    pub async fn start(self) -> Result<ListenersRunner, MercuryError> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => ConsumptionExecutor::from_config(&self.consumer.executor)?,
        };

        let provisioned = Topology::new(self.queue_client.clone(), self.topic_client.clone())
            .install(&self.consumer, &self.topic_names_prefix)
            .await?;

        let consumption = Consumption {
            registry: self.registry,
            queue_client: self.queue_client,
            metrics: self.metrics,
            tracer: Arc::new(global::tracer(TRACER_NAME)),
        };

        let mut listeners = Vec::new();
        for subscription in provisioned {
            let id = subscription.config.id().clone();

            listeners.push(Arc::new(TopicQueueListener::new(
                QueueTarget {
                    id: id.clone(),
                    kind: QueueKind::Main,
                    url: subscription.queue_url,
                },
                subscription.config.queue_config().clone(),
                consumption.clone(),
                executor.clone(),
            )));

            if let Some(dlq_url) = subscription.dlq_url {
                listeners.push(Arc::new(TopicQueueListener::new(
                    QueueTarget {
                        id,
                        kind: QueueKind::DeadLetter,
                        url: dlq_url,
                    },
                    subscription.config.dlq_config().queue_config().clone(),
                    consumption.clone(),
                    executor.clone(),
                )));
            }
        }

        let (shutdown, _) = watch::channel(false);
        let tasks = listeners
            .iter()
            .map(|listener| tokio::spawn(run_listener(listener.clone(), shutdown.subscribe())))
            .collect();

        info!(listeners = listeners.len(), "listeners started");

        Ok(ListenersRunner {
            listeners,
            executor,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Scheduler of every topic queue listener of the application.
pub struct ListenersRunner {
    listeners: Vec<Arc<TopicQueueListener>>,
    executor: ConsumptionExecutor,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenersRunner {
    pub fn builder(
        registry: Arc<ConsumerRegistry>,
        queue_client: Arc<dyn QueueClient>,
        topic_client: Arc<dyn TopicClient>,
    ) -> ListenersRunnerBuilder {
        ListenersRunnerBuilder {
            registry,
            queue_client,
            topic_client,
            consumer: ConsumerConfig::default(),
            topic_names_prefix: String::new(),
            metrics: Arc::new(NoopConsumerMetrics),
            executor: None,
        }
    }

    pub fn listeners(&self) -> &[Arc<TopicQueueListener>] {
        &self.listeners
    }

    pub fn executor(&self) -> &ConsumptionExecutor {
        &self.executor
    }

    /// Stops scheduling polls and waits for the listener loops to exit.
    ///
    /// Jobs already submitted keep running; use [`ListenersRunner::drain`] to
    /// wait for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(err) = result {
                error!(error = err.to_string(), "listener task failure");
            }
        }

        info!("listeners stopped");
    }

    /// Waits until every submitted consumption job has finished.
    pub async fn drain(&self) {
        self.executor.wait_idle().await;
    }
}

async fn run_listener(listener: Arc<TopicQueueListener>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(listener.polling_interval()) => {}
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            result = listener.poll() => {
                if let Err(err) = result {
                    error!(
                        subscription = %listener.kind().label(listener.id()),
                        error = err.to_string(),
                        "poll failure, retrying on next tick"
                    );
                }
            }
        }
    }
}
