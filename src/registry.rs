// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Maps a subscription and queue kind to the handler consuming its messages.
//! Two handler flavors exist:
//! - [`TransportHandler`]: receives the untouched transport message, and
//! - [`EnvelopeHandler`]: receives the decoded [`Envelope`].
//!
//! When both flavors are registered for the same subscription and kind, only
//! the transport handler is invoked.

use crate::{
    backend::TransportMessage,
    envelope::{Envelope, TypedEnvelope},
    errors::{BoxError, MercuryError},
    serialization::SerializationRegistry,
    subscription::{QueueKind, SubscriptionId},
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData, sync::Arc};
use tracing::info;

/// Handler consuming decoded envelopes.
///
/// Handlers run inside the `consume` tracing span of their message, with the
/// envelope's correlation ids recorded on it, and with an OpenTelemetry
/// context whose active span is the consumer span.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Handles one envelope.
    ///
    /// # Parameters
    /// * `envelope` - The decoded envelope
    ///
    /// # Returns
    /// `Ok(())` deletes the message from its queue. Any error leaves it there
    /// for redelivery once its visibility timeout expires.
    async fn handle(&self, envelope: Envelope) -> Result<(), BoxError>;
}

/// Handler consuming raw transport messages.
///
/// The body is not decoded, so no correlation ids or trace context are
/// extracted for it.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn handle(&self, message: &TransportMessage) -> Result<(), BoxError>;
}

/// Adapts an async closure into an [`EnvelopeHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnEnvelopeHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnEnvelopeHandler { f }
}

/// Adapts an async closure into a [`TransportHandler`].
pub fn transport_handler_fn<F, Fut>(f: F) -> FnTransportHandler<F>
where
    F: Fn(TransportMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnTransportHandler { f }
}

/// [`EnvelopeHandler`] built by [`handler_fn`].
pub struct FnEnvelopeHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for FnEnvelopeHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), BoxError> {
        (self.f)(envelope).await
    }
}

/// [`TransportHandler`] built by [`transport_handler_fn`].
pub struct FnTransportHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TransportHandler for FnTransportHandler<F>
where
    F: Fn(TransportMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, message: &TransportMessage) -> Result<(), BoxError> {
        (self.f)(message.clone()).await
    }
}

/// Decodes the envelope payload before handing a [`TypedEnvelope`] to the user handler.
struct DecodingHandler<T, D, F> {
    decode: D,
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, D, F, Fut> EnvelopeHandler for DecodingHandler<T, D, F>
where
    T: Send + 'static,
    D: Fn(&str, &str) -> Result<T, MercuryError> + Send + Sync,
    F: Fn(TypedEnvelope<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), BoxError> {
        let payload = (self.decode)(envelope.serialized_payload(), envelope.content_type())?;
        (self.handler)(TypedEnvelope::new(envelope, payload)).await
    }
}

type Key = (SubscriptionId, QueueKind);

/// Registry of consumers for every subscription of the application.
///
/// Handlers are keyed by subscription and by [`QueueKind`]: the main queue and
/// the dead-letter queue of a subscription each have their own handler.
/// Registering again for the same key replaces the previous handler.
///
/// Safe to mutate and read concurrently; lookups never block on writers of
/// other subscriptions.
///
/// # Example
/// ```rust,no_run
/// use mercury::{
///     registry::{handler_fn, ConsumerRegistry},
///     serialization::SerializationRegistry,
///     subscription::SubscriptionId,
/// };
/// use std::sync::Arc;
///
/// let registry = ConsumerRegistry::new(Arc::new(SerializationRegistry::new()));
/// registry.set_consumer(
///     &SubscriptionId::for_topic("orders"),
///     handler_fn(|envelope| async move {
///         println!("{}", envelope.serialized_payload());
///         Ok(())
///     }),
/// );
/// ```
pub struct ConsumerRegistry {
    serialization: Arc<SerializationRegistry>,
    envelope_handlers: DashMap<Key, Arc<dyn EnvelopeHandler>>,
    transport_handlers: DashMap<Key, Arc<dyn TransportHandler>>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    ///
    /// # Parameters
    /// * `serialization` - Registry decoding payloads for typed consumers
    pub fn new(serialization: Arc<SerializationRegistry>) -> ConsumerRegistry {
        ConsumerRegistry {
            serialization,
            envelope_handlers: DashMap::new(),
            transport_handlers: DashMap::new(),
        }
    }

    pub fn serialization(&self) -> &Arc<SerializationRegistry> {
        &self.serialization
    }

    /// Registers the envelope handler of a subscription's main queue.
    ///
    /// # Parameters
    /// * `id` - Subscription the handler consumes
    /// * `handler` - Handler receiving each decoded envelope
    pub fn set_consumer<H>(&self, id: &SubscriptionId, handler: H)
    where
        H: EnvelopeHandler + 'static,
    {
        self.insert_envelope(id, QueueKind::Main, Arc::new(handler));
    }

    /// Registers the envelope handler of a subscription's dead-letter queue.
    ///
    /// Without one, dead letters stay on the queue and each poll warns.
    pub fn set_dlq_consumer<H>(&self, id: &SubscriptionId, handler: H)
    where
        H: EnvelopeHandler + 'static,
    {
        self.insert_envelope(id, QueueKind::DeadLetter, Arc::new(handler));
    }

    /// Registers a raw message handler, taking precedence over any envelope handler.
    pub fn set_transport_consumer<H>(&self, id: &SubscriptionId, handler: H)
    where
        H: TransportHandler + 'static,
    {
        self.insert_transport(id, QueueKind::Main, Arc::new(handler));
    }

    pub fn set_dlq_transport_consumer<H>(&self, id: &SubscriptionId, handler: H)
    where
        H: TransportHandler + 'static,
    {
        self.insert_transport(id, QueueKind::DeadLetter, Arc::new(handler));
    }

    /// Registers a handler of payloads decoded by the serialization registry,
    /// dispatched on each envelope's own content-type.
    pub fn set_typed_consumer<T, F, Fut>(&self, id: &SubscriptionId, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(TypedEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = self.registry_decoding(handler);
        self.insert_envelope(id, QueueKind::Main, Arc::new(handler));
    }

    pub fn set_dlq_typed_consumer<T, F, Fut>(&self, id: &SubscriptionId, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(TypedEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = self.registry_decoding(handler);
        self.insert_envelope(id, QueueKind::DeadLetter, Arc::new(handler));
    }

    /// Registers a handler of payloads decoded by `decode(payload, content_type)`.
    ///
    /// # Parameters
    /// * `id` - Subscription the handler consumes
    /// * `decode` - Decoder of the serialized payload; its error fails the
    ///   message as undecodable
    /// * `handler` - Handler receiving the decoded payload with its envelope
    pub fn set_deserializing_consumer<T, D, F, Fut>(&self, id: &SubscriptionId, decode: D, handler: F)
    where
        T: Send + 'static,
        D: Fn(&str, &str) -> Result<T, MercuryError> + Send + Sync + 'static,
        F: Fn(TypedEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = DecodingHandler {
            decode,
            handler,
            _payload: PhantomData,
        };
        self.insert_envelope(id, QueueKind::Main, Arc::new(handler));
    }

    pub fn set_dlq_deserializing_consumer<T, D, F, Fut>(
        &self,
        id: &SubscriptionId,
        decode: D,
        handler: F,
    ) where
        T: Send + 'static,
        D: Fn(&str, &str) -> Result<T, MercuryError> + Send + Sync + 'static,
        F: Fn(TypedEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = DecodingHandler {
            decode,
            handler,
            _payload: PhantomData,
        };
        self.insert_envelope(id, QueueKind::DeadLetter, Arc::new(handler));
    }

    /// Returns the envelope handler registered for the subscription and kind.
    pub fn get_consumer(&self, id: &SubscriptionId, kind: QueueKind) -> Option<Arc<dyn EnvelopeHandler>> {
        self.envelope_handlers
            .get(&(id.clone(), kind))
            .map(|entry| entry.value().clone())
    }

    pub fn get_transport_consumer(
        &self,
        id: &SubscriptionId,
        kind: QueueKind,
    ) -> Option<Arc<dyn TransportHandler>> {
        self.transport_handlers
            .get(&(id.clone(), kind))
            .map(|entry| entry.value().clone())
    }

    /// Whether a handler of either flavor exists for the subscription and kind.
    pub fn has_consumer(&self, id: &SubscriptionId, kind: QueueKind) -> bool {
        let key = (id.clone(), kind);
        self.transport_handlers.contains_key(&key) || self.envelope_handlers.contains_key(&key)
    }

    pub fn remove_consumer(&self, id: &SubscriptionId) {
        self.remove_envelope(id, QueueKind::Main);
    }

    pub fn remove_dlq_consumer(&self, id: &SubscriptionId) {
        self.remove_envelope(id, QueueKind::DeadLetter);
    }

    pub fn remove_transport_consumer(&self, id: &SubscriptionId) {
        self.remove_transport(id, QueueKind::Main);
    }

    pub fn remove_dlq_transport_consumer(&self, id: &SubscriptionId) {
        self.remove_transport(id, QueueKind::DeadLetter);
    }

    fn registry_decoding<T, F, Fut>(&self, handler: F) -> impl EnvelopeHandler + 'static
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(TypedEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let serialization = self.serialization.clone();
        DecodingHandler {
            decode: move |payload: &str, content_type: &str| {
                serialization.deserialize::<T>(payload, content_type)
            },
            handler,
            _payload: PhantomData,
        }
    }

    fn insert_envelope(&self, id: &SubscriptionId, kind: QueueKind, handler: Arc<dyn EnvelopeHandler>) {
        self.envelope_handlers.insert((id.clone(), kind), handler);
        info!(subscription = %kind.label(id), "registered an envelope consumer");
    }

    fn insert_transport(&self, id: &SubscriptionId, kind: QueueKind, handler: Arc<dyn TransportHandler>) {
        self.transport_handlers.insert((id.clone(), kind), handler);
        info!(subscription = %kind.label(id), "registered a transport consumer");
    }

    fn remove_envelope(&self, id: &SubscriptionId, kind: QueueKind) {
        if self.envelope_handlers.remove(&(id.clone(), kind)).is_some() {
            info!(subscription = %kind.label(id), "removed an envelope consumer");
        }
    }

    fn remove_transport(&self, id: &SubscriptionId, kind: QueueKind) {
        if self.transport_handlers.remove(&(id.clone(), kind)).is_some() {
            info!(subscription = %kind.label(id), "removed a transport consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CONTENT_TYPE_JSON, CONTENT_TYPE_PLAIN};
    use serde::Deserialize;
    use std::sync::Mutex;

    fn registry() -> ConsumerRegistry {
        ConsumerRegistry::new(Arc::new(SerializationRegistry::new()))
    }

    fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
        Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderPlaced {
        id: u32,
    }

    #[test]
    fn set_then_get_returns_the_handler() {
        let registry = registry();
        let id = SubscriptionId::for_topic("orders");

        registry.set_consumer(&id, handler_fn(|_| async { Ok(()) }));
        let first = registry.get_consumer(&id, QueueKind::Main).unwrap();
        let again = registry.get_consumer(&id, QueueKind::Main).unwrap();

        assert!(same(&first, &again));
        assert!(registry.get_consumer(&id, QueueKind::DeadLetter).is_none());
    }

    #[test]
    fn registering_twice_overwrites() {
        let registry = registry();
        let id = SubscriptionId::for_topic("orders");

        registry.set_consumer(&id, handler_fn(|_| async { Ok(()) }));
        let first = registry.get_consumer(&id, QueueKind::Main).unwrap();
        registry.set_consumer(&id, handler_fn(|_| async { Ok(()) }));
        let second = registry.get_consumer(&id, QueueKind::Main).unwrap();

        assert!(!same(&first, &second));
    }

    #[test]
    fn removing_clears_only_its_kind() {
        let registry = registry();
        let id = SubscriptionId::for_topic_with_queue("orders", "audit");

        registry.set_consumer(&id, handler_fn(|_| async { Ok(()) }));
        registry.set_dlq_consumer(&id, handler_fn(|_| async { Ok(()) }));
        registry.remove_consumer(&id);

        assert!(registry.get_consumer(&id, QueueKind::Main).is_none());
        assert!(!registry.has_consumer(&id, QueueKind::Main));
        assert!(registry.has_consumer(&id, QueueKind::DeadLetter));

        registry.remove_dlq_consumer(&id);
        assert!(!registry.has_consumer(&id, QueueKind::DeadLetter));
    }

    #[test]
    fn transport_consumers_count_as_consumers() {
        let registry = registry();
        let id = SubscriptionId::for_topic("orders");

        registry.set_dlq_transport_consumer(&id, transport_handler_fn(|_| async { Ok(()) }));

        assert!(registry.has_consumer(&id, QueueKind::DeadLetter));
        assert!(registry.get_transport_consumer(&id, QueueKind::DeadLetter).is_some());
        assert!(registry.get_consumer(&id, QueueKind::DeadLetter).is_none());

        registry.remove_dlq_transport_consumer(&id);
        assert!(!registry.has_consumer(&id, QueueKind::DeadLetter));
    }

    #[tokio::test]
    async fn typed_consumer_decodes_with_registry() {
        let registry = registry();
        let id = SubscriptionId::for_topic("orders");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        registry.set_typed_consumer(&id, move |message: TypedEnvelope<OrderPlaced>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message.payload().id);
                Ok(())
            }
        });

        let handler = registry.get_consumer(&id, QueueKind::Main).unwrap();
        handler
            .handle(Envelope::new("orders", CONTENT_TYPE_JSON, r#"{"id":7}"#))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn typed_consumer_fails_without_deserializer() {
        let registry = registry();
        let id = SubscriptionId::for_topic("orders");
        registry.set_typed_consumer(&id, |_: TypedEnvelope<OrderPlaced>| async { Ok(()) });

        let handler = registry.get_consumer(&id, QueueKind::Main).unwrap();
        let err = handler
            .handle(Envelope::new("orders", CONTENT_TYPE_PLAIN, "7"))
            .await
            .unwrap_err();

        let err = err.downcast::<MercuryError>().unwrap();
        assert_eq!(
            *err,
            MercuryError::NoDeserializerRegistered(CONTENT_TYPE_PLAIN.to_owned())
        );
    }

    #[tokio::test]
    async fn deserializing_consumer_uses_supplied_decoder() {
        let registry = registry();
        let id = SubscriptionId::for_topic("greetings");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        registry.set_dlq_deserializing_consumer(
            &id,
            |payload: &str, content_type: &str| Ok(format!("{content_type}:{payload}")),
            move |message: TypedEnvelope<String>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(message.payload().clone());
                    Ok(())
                }
            },
        );

        let handler = registry.get_consumer(&id, QueueKind::DeadLetter).unwrap();
        handler
            .handle(Envelope::new("greetings", CONTENT_TYPE_PLAIN, "hi"))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["text/plain:hi".to_owned()]);
    }
}
