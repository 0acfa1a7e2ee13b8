// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization Registry
//!
//! Maps content-types to payload deserializers, and `(content-type, type)`
//! pairs to payload serializers.
//!
//! Serializer resolution walks an explicit type hierarchy declared through the
//! [`Payload`] trait. For a value of type `T` the lookup checks, in order:
//! 1. `T` itself,
//! 2. recursively, the value `T` extends ([`Payload::parent`]), which covers
//!    the whole parent chain and the interfaces declared along it,
//! 3. the interface tags `T` declares ([`Payload::interfaces`]), in order,
//! 4. the universal base entry ([`TypeTag::Base`]).
//!
//! Whichever entry matches, the serializer is always applied to the value
//! passed to [`SerializationRegistry::serialize`], so a serializer found on a
//! supertype still sees every field of the subtype.
//!
//! A JSON serializer for the base and a JSON deserializer are registered when
//! the registry is created.

use crate::{
    envelope::{CONTENT_TYPE_JSON, CONTENT_TYPE_THRIFT_JSON},
    errors::{BoxError, MercuryError},
};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};
use tracing::info;

/// Serializer stored in the registry, applied to the value being serialized.
pub type SerializerFn = Arc<dyn Fn(&dyn ErasedPayload) -> Result<String, BoxError> + Send + Sync>;

/// Deserializer stored in the registry, producing an intermediate JSON value.
pub type DeserializerFn = Arc<dyn Fn(&str) -> Result<Value, BoxError> + Send + Sync>;

/// A node of the payload type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// A concrete Rust type
    Type { id: TypeId, name: &'static str },
    /// A named capability shared by several types
    Interface(&'static str),
    /// The universal base every payload extends
    Base,
}

impl TypeTag {
    /// Tag of the concrete type `T`.
    ///
    /// Two tags built from the same type compare equal; the type name is only
    /// carried for log lines and error messages.
    pub fn of<T: Any>() -> TypeTag {
        TypeTag::Type {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Tag of a named interface, usable in `const` items.
    ///
    /// # Parameters
    /// * `name` - Interface name, unique across the application
    pub const fn interface(name: &'static str) -> TypeTag {
        TypeTag::Interface(name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Type { name, .. } => f.write_str(name),
            TypeTag::Interface(name) => write!(f, "interface {name}"),
            TypeTag::Base => f.write_str("base"),
        }
    }
}

/// A value that can be published as a message payload.
///
/// Types with no supertypes need only `impl Payload for MyType {}`.
pub trait Payload: Serialize + Send + Sync + 'static {
    /// The embedded value this payload extends, if any.
    fn parent(&self) -> Option<&dyn ErasedPayload> {
        None
    }

    /// Interfaces declared directly by this type, in lookup order.
    fn interfaces(&self) -> Vec<TypeTag> {
        Vec::new()
    }
}

/// Object-safe view of a [`Payload`], used by the registry and by serializers
/// registered for interfaces or the base.
pub trait ErasedPayload: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn type_tag(&self) -> TypeTag;
    fn parent_payload(&self) -> Option<&dyn ErasedPayload>;
    fn declared_interfaces(&self) -> Vec<TypeTag>;
    fn to_json(&self) -> serde_json::Result<String>;
    fn to_json_value(&self) -> serde_json::Result<Value>;
}

impl dyn ErasedPayload + '_ {
    /// Returns the value as a `T` when it is one.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Serializes the full value behind the trait object, through its JSON form.
impl Serialize for dyn ErasedPayload + '_ {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<T: Payload> ErasedPayload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn parent_payload(&self) -> Option<&dyn ErasedPayload> {
        Payload::parent(self)
    }

    fn declared_interfaces(&self) -> Vec<TypeTag> {
        Payload::interfaces(self)
    }

    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn to_json_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

impl Payload for String {}
impl Payload for &'static str {}
impl Payload for Value {}
impl Payload for bool {}
impl Payload for i64 {}
impl Payload for u64 {}
impl Payload for f64 {}

/// Registry of payload serializers and deserializers.
///
/// Safe to share between threads; registrations are visible to concurrent
/// readers immediately.
pub struct SerializationRegistry {
    serializers: DashMap<String, DashMap<TypeTag, SerializerFn>>,
    deserializers: DashMap<String, DeserializerFn>,
}

impl Default for SerializationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SerializationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationRegistry")
            .field("serializers", &self.serializers.len())
            .field("deserializers", &self.deserializers.len())
            .finish()
    }
}

impl SerializationRegistry {
    /// Creates a registry with the default JSON serializer and deserializer.
    pub fn new() -> SerializationRegistry {
        let registry = SerializationRegistry::empty();
        registry.set_base_serializer(CONTENT_TYPE_JSON, |payload| Ok(payload.to_json()?));
        registry.set_json_deserializer(|payload| Ok(serde_json::from_str(payload)?));
        registry
    }

    /// Creates a registry without any entries.
    pub fn empty() -> SerializationRegistry {
        SerializationRegistry {
            serializers: DashMap::new(),
            deserializers: DashMap::new(),
        }
    }

    /// Registers a serializer for values of type `T` and of every type extending it.
    ///
    /// The serializer receives the value passed to [`serialize`](Self::serialize),
    /// which may be a subtype of `T`. Use [`ErasedPayload::to_json_value`],
    /// serde directly (`serde_json::to_string(payload)`), or
    /// `payload.downcast_ref::<T>()` when only `T`'s own shape matters.
    ///
    /// # Parameters
    /// * `content_type` - Content-type the serializer produces
    /// * `serializer` - Function turning the payload into its wire text
    pub fn set_serializer<T, F>(&self, content_type: &str, serializer: F)
    where
        T: Payload,
        F: Fn(&dyn ErasedPayload) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.insert_serializer(content_type, TypeTag::of::<T>(), Arc::new(serializer));
    }

    /// Shorthand for `set_serializer::<T>("application/json", ..)`.
    pub fn set_json_serializer<T, F>(&self, serializer: F)
    where
        T: Payload,
        F: Fn(&dyn ErasedPayload) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.set_serializer::<T, F>(CONTENT_TYPE_JSON, serializer);
    }

    /// Shorthand for `set_serializer::<T>("application/x-thrift+json", ..)`.
    pub fn set_thrift_serializer<T, F>(&self, serializer: F)
    where
        T: Payload,
        F: Fn(&dyn ErasedPayload) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.set_serializer::<T, F>(CONTENT_TYPE_THRIFT_JSON, serializer);
    }

    /// Registers a serializer for every type declaring the interface `tag`.
    ///
    /// Like type-keyed serializers, it receives the value being serialized.
    pub fn set_interface_serializer<F>(&self, tag: TypeTag, content_type: &str, serializer: F)
    where
        F: Fn(&dyn ErasedPayload) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.insert_serializer(content_type, tag, Arc::new(serializer));
    }

    /// Registers the catch-all serializer of a content-type.
    pub fn set_base_serializer<F>(&self, content_type: &str, serializer: F)
    where
        F: Fn(&dyn ErasedPayload) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.insert_serializer(content_type, TypeTag::Base, Arc::new(serializer));
    }

    fn insert_serializer(&self, content_type: &str, tag: TypeTag, serializer: SerializerFn) {
        self.serializers
            .entry(content_type.to_owned())
            .or_default()
            .insert(tag, serializer);
        info!(content_type, type_name = %tag, "registered a serializer");
    }

    /// Serializes `value` with the most specific serializer registered for `content_type`.
    pub fn serialize<T: Payload>(&self, value: &T, content_type: &str) -> Result<String, MercuryError> {
        let root: &dyn ErasedPayload = value;

        let Some(serializer) = self.resolve(content_type, root) else {
            return Err(MercuryError::NoSerializerRegistered {
                content_type: content_type.to_owned(),
                type_name: root.type_tag().to_string(),
            });
        };

        serializer(root).map_err(|err| MercuryError::SerializationError(err.to_string()))
    }

    fn resolve(&self, content_type: &str, root: &dyn ErasedPayload) -> Option<SerializerFn> {
        let by_type = self.serializers.get(content_type)?;

        find_in_hierarchy(&by_type, root).or_else(|| {
            by_type
                .get(&TypeTag::Base)
                .map(|serializer| serializer.value().clone())
        })
    }

    /// Registers a deserializer for payloads of the given content-type.
    pub fn set_deserializer<F>(&self, content_type: &str, deserializer: F)
    where
        F: Fn(&str) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.deserializers
            .insert(content_type.to_owned(), Arc::new(deserializer));
        info!(content_type, "registered a deserializer");
    }

    /// Shorthand for `set_deserializer("application/json", ..)`.
    pub fn set_json_deserializer<F>(&self, deserializer: F)
    where
        F: Fn(&str) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.set_deserializer(CONTENT_TYPE_JSON, deserializer);
    }

    /// Shorthand for `set_deserializer("application/x-thrift+json", ..)`.
    pub fn set_thrift_deserializer<F>(&self, deserializer: F)
    where
        F: Fn(&str) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.set_deserializer(CONTENT_TYPE_THRIFT_JSON, deserializer);
    }

    pub fn has_deserializer(&self, content_type: &str) -> bool {
        self.deserializers.contains_key(content_type)
    }

    /// Deserializes a payload of the given content-type into `T`.
    pub fn deserialize<T: DeserializeOwned>(
        &self,
        serialized_payload: &str,
        content_type: &str,
    ) -> Result<T, MercuryError> {
        let deserializer = self
            .deserializers
            .get(content_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MercuryError::NoDeserializerRegistered(content_type.to_owned()))?;

        let value = deserializer(serialized_payload)
            .map_err(|err| MercuryError::DecodeError(err.to_string()))?;

        serde_json::from_value(value).map_err(|err| MercuryError::DecodeError(err.to_string()))
    }
}

fn find_in_hierarchy(
    by_type: &DashMap<TypeTag, SerializerFn>,
    node: &dyn ErasedPayload,
) -> Option<SerializerFn> {
    if let Some(serializer) = by_type.get(&node.type_tag()) {
        return Some(serializer.value().clone());
    }

    if let Some(found) = node
        .parent_payload()
        .and_then(|parent| find_in_hierarchy(by_type, parent))
    {
        return Some(found);
    }

    node.declared_interfaces()
        .iter()
        .find_map(|tag| by_type.get(tag).map(|serializer| serializer.value().clone()))
}
