// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Queue Listener
//!
//! One listener polls one queue: the main queue of a subscription or its
//! dead-letter queue. Each tick either skips (no consumer registered) or
//! issues a single bounded receive and hands every received message to the
//! consumption executor without waiting for it to be processed.

use crate::{
    consumer::{Consumption, QueueTarget},
    errors::MercuryError,
    executor::ConsumptionExecutor,
    queue::{QueueConfig, MAX_BATCH_SIZE},
    subscription::{QueueKind, SubscriptionId},
};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Result of one listener tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No consumer is registered; the queue was not polled.
    Skipped,
    /// The queue was polled and this many messages were submitted.
    Received(usize),
}

/// Poller of a single subscription queue.
///
/// Listeners are built and scheduled by the
/// [`ListenersRunner`](crate::dispatcher::ListenersRunner), one per provisioned
/// main queue and one per enabled dead-letter queue.
pub struct TopicQueueListener {
    target: QueueTarget,
    queue: QueueConfig,
    consumption: Consumption,
    executor: ConsumptionExecutor,
}

impl TopicQueueListener {
    pub(crate) fn new(
        target: QueueTarget,
        queue: QueueConfig,
        consumption: Consumption,
        executor: ConsumptionExecutor,
    ) -> TopicQueueListener {
        TopicQueueListener {
            target,
            queue,
            consumption,
            executor,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.target.id
    }

    pub fn kind(&self) -> QueueKind {
        self.target.kind
    }

    pub fn queue_url(&self) -> &str {
        &self.target.url
    }

    /// Delay between the end of one tick and the start of the next.
    pub fn polling_interval(&self) -> Duration {
        self.queue.polling_interval()
    }

    /// Runs one tick.
    ///
    /// # Returns
    /// [`PollOutcome::Skipped`] when no consumer is registered for the queue,
    /// otherwise the number of messages handed to the executor. A failed
    /// receive is logged and returned as a polling error.
    pub async fn poll(&self) -> Result<PollOutcome, MercuryError> {
        let id = &self.target.id;
        let label = self.target.label();

        if !self
            .consumption
            .registry
            .has_consumer(id, self.target.kind)
        {
            warn!(subscription = %label, "no consumer registered, skipping poll");
            return Ok(PollOutcome::Skipped);
        }

        let messages = match self
            .consumption
            .queue_client
            .receive_messages(&self.target.url, MAX_BATCH_SIZE, self.queue.long_poll_wait())
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                self.consumption.metrics.on_poll_failure(id);
                error!(subscription = %label, error = err.to_string(), "failure to poll queue");
                return Err(match err {
                    err @ MercuryError::PollingError(_) => err,
                    _ => MercuryError::PollingError(self.target.url.clone()),
                });
            }
        };

        let count = messages.len();
        self.consumption.metrics.on_poll_success(id, count);
        if count == 0 {
            self.consumption.metrics.on_empty_poll(id);
        }
        if count >= MAX_BATCH_SIZE {
            self.consumption.metrics.on_full_batch_poll(id);
        }
        debug!(subscription = %label, count, "received messages");

        for message in messages {
            let consumption = self.consumption.clone();
            let target = self.target.clone();
            self.executor.submit(async move {
                let _ = consumption.consume(&target, message).await;
            });
        }

        Ok(PollOutcome::Received(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MockQueueClient, TransportMessage},
        envelope::{Envelope, CONTENT_TYPE_PLAIN},
        metrics::{ConsumerMetrics, MockConsumerMetrics, NoopConsumerMetrics},
        otel::TRACER_NAME,
        registry::{handler_fn, ConsumerRegistry},
        serialization::SerializationRegistry,
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::{layer::Context, prelude::*, Layer};

    /// Counts WARN events emitted while installed.
    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn listener(
        kind: QueueKind,
        registry: ConsumerRegistry,
        client: MockQueueClient,
        metrics: Arc<dyn ConsumerMetrics>,
        executor: ConsumptionExecutor,
    ) -> TopicQueueListener {
        let consumption = Consumption {
            registry: Arc::new(registry),
            queue_client: Arc::new(client),
            metrics,
            tracer: Arc::new(opentelemetry::global::tracer(TRACER_NAME)),
        };
        TopicQueueListener::new(
            QueueTarget {
                id: SubscriptionId::for_topic("orders"),
                kind,
                url: "memory://queues/app-orders".to_owned(),
            },
            QueueConfig::default(),
            consumption,
            executor,
        )
    }

    fn registry() -> ConsumerRegistry {
        ConsumerRegistry::new(Arc::new(SerializationRegistry::new()))
    }

    fn messages(count: usize) -> Vec<TransportMessage> {
        let body = Envelope::new("orders", CONTENT_TYPE_PLAIN, "x")
            .to_transport_body()
            .unwrap();
        (0..count)
            .map(|i| TransportMessage {
                message_id: format!("m-{i}"),
                body: body.clone(),
                ack_handle: format!("r-{i}"),
                ..TransportMessage::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn no_consumer_skips_receive_and_warns_once_per_tick() {
        let warnings = WarnCounter::default();
        let _guard = tracing_subscriber::registry()
            .with(warnings.clone())
            .set_default();

        let mut client = MockQueueClient::new();
        client.expect_receive_messages().times(0);

        let listener = listener(
            QueueKind::DeadLetter,
            registry(),
            client,
            Arc::new(NoopConsumerMetrics),
            ConsumptionExecutor::elastic(),
        );

        assert_eq!(listener.poll().await, Ok(PollOutcome::Skipped));
        assert_eq!(warnings.0.load(Ordering::SeqCst), 1);
        assert_eq!(listener.poll().await, Ok(PollOutcome::Skipped));
        assert_eq!(warnings.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_batch_is_metered_and_dispatched() {
        let registry = registry();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        registry.set_consumer(
            &SubscriptionId::for_topic("orders"),
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let mut client = MockQueueClient::new();
        client
            .expect_receive_messages()
            .withf(|url, max, wait| {
                url == "memory://queues/app-orders"
                    && *max == MAX_BATCH_SIZE
                    && *wait == Duration::from_secs(20)
            })
            .times(1)
            .returning(|_, _, _| Ok(messages(MAX_BATCH_SIZE)));
        client
            .expect_delete_message()
            .times(MAX_BATCH_SIZE)
            .returning(|_, _| Ok(()));

        let mut metrics = MockConsumerMetrics::new();
        metrics
            .expect_on_poll_success()
            .withf(|_, count| *count == MAX_BATCH_SIZE)
            .times(1)
            .return_const(());
        metrics.expect_on_full_batch_poll().times(1).return_const(());
        metrics.expect_on_empty_poll().times(0);
        metrics.expect_on_delivery_latency().return_const(());
        metrics.expect_on_consumption_success().return_const(());

        let executor = ConsumptionExecutor::elastic();
        let listener = listener(
            QueueKind::Main,
            registry,
            client,
            Arc::new(metrics),
            executor.clone(),
        );

        assert_eq!(listener.poll().await, Ok(PollOutcome::Received(MAX_BATCH_SIZE)));
        executor.wait_idle().await;
        assert_eq!(handled.load(Ordering::SeqCst), MAX_BATCH_SIZE);
    }

    #[tokio::test]
    async fn empty_poll_is_metered() {
        let registry = registry();
        registry.set_consumer(
            &SubscriptionId::for_topic("orders"),
            handler_fn(|_| async { Ok(()) }),
        );

        let mut client = MockQueueClient::new();
        client
            .expect_receive_messages()
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));

        let mut metrics = MockConsumerMetrics::new();
        metrics.expect_on_poll_success().times(1).return_const(());
        metrics.expect_on_empty_poll().times(1).return_const(());
        metrics.expect_on_full_batch_poll().times(0);

        let listener = listener(
            QueueKind::Main,
            registry,
            client,
            Arc::new(metrics),
            ConsumptionExecutor::elastic(),
        );

        assert_eq!(listener.poll().await, Ok(PollOutcome::Received(0)));
    }

    #[tokio::test]
    async fn poll_failure_is_metered_and_returned() {
        let registry = registry();
        registry.set_consumer(
            &SubscriptionId::for_topic("orders"),
            handler_fn(|_| async { Ok(()) }),
        );

        let mut client = MockQueueClient::new();
        client
            .expect_receive_messages()
            .times(1)
            .returning(|_, _, _| Err(MercuryError::InternalError));

        let mut metrics = MockConsumerMetrics::new();
        metrics.expect_on_poll_failure().times(1).return_const(());
        metrics.expect_on_poll_success().times(0);

        let listener = listener(
            QueueKind::Main,
            registry,
            client,
            Arc::new(metrics),
            ConsumptionExecutor::elastic(),
        );

        assert_eq!(
            listener.poll().await,
            Err(MercuryError::PollingError("memory://queues/app-orders".to_owned()))
        );
    }
}
