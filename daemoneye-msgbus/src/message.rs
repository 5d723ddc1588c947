//! Message types, runtime type descriptors and the wire type registry
//!
//! A message is any `serde` type implementing [`BusMessage`]. The wire carries
//! a type tag ([`BusMessage::TYPE_NAME`]) next to the serialized body; the
//! [`MessageRegistry`] maps tags back to runtime types and decodes bodies into
//! type-erased [`AnyMessage`] values that consumers downcast.

use crate::error::{BusError, Result};
use crate::serializer::{JsonSerializer, MessageSerializer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed message that can travel over the bus
///
/// ```rust
/// use daemoneye_msgbus::BusMessage;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl BusMessage for OrderPlaced {
///     const TYPE_NAME: &'static str = "orders.placed";
///     const EXCHANGE: Option<&'static str> = Some("orders");
/// }
/// ```
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static {
    /// Wire type tag, also used as the pub/sub routing key
    const TYPE_NAME: &'static str;

    /// Exchange the message is published on, read by [`DefaultExchangeResolver`]
    ///
    /// [`DefaultExchangeResolver`]: crate::routing::DefaultExchangeResolver
    const EXCHANGE: Option<&'static str> = None;

    /// Reply types are only delivered point-to-point and never bound for pub/sub
    const IS_REPLY: bool = false;

    /// Runtime descriptor of this message type
    fn message_type() -> MessageType
    where
        Self: Sized,
    {
        MessageType::of::<Self>()
    }
}

/// Runtime descriptor of a message type
#[derive(Clone, Copy)]
pub struct MessageType {
    name: &'static str,
    exchange: Option<&'static str>,
    is_reply: bool,
    type_id: TypeId,
}

impl MessageType {
    /// Descriptor for a concrete message type
    pub fn of<T: BusMessage>() -> Self {
        Self {
            name: T::TYPE_NAME,
            exchange: T::EXCHANGE,
            is_reply: T::IS_REPLY,
            type_id: TypeId::of::<T>(),
        }
    }

    /// Wire type tag
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Exchange declared by the message type, if any
    pub const fn declared_exchange(&self) -> Option<&'static str> {
        self.exchange
    }

    /// Whether this is a reply type
    pub const fn is_reply(&self) -> bool {
        self.is_reply
    }

    /// Rust type identity of the message
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Whether this descriptor refers to `T`
    pub fn is<T: BusMessage>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for MessageType {}

impl std::hash::Hash for MessageType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("exchange", &self.exchange)
            .field("is_reply", &self.is_reply)
            .finish()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Object-safe view of a deserialized message
pub trait AnyMessage: Any + Send + Sync + fmt::Debug {
    /// Runtime descriptor of the concrete type
    fn runtime_type(&self) -> MessageType;

    /// Upcast for downcasting
    fn as_any(&self) -> &dyn Any;
}

impl<T: BusMessage> AnyMessage for T {
    fn runtime_type(&self) -> MessageType {
        MessageType::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyMessage {
    /// Downcast to a concrete message type
    pub fn downcast_ref<T: BusMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Whether the message is of type `T`
    pub fn is<T: BusMessage>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Per-type codec with the serializer captured at registration
trait ErasedCodec: Send + Sync {
    fn message_type(&self) -> MessageType;
    fn encode(&self, message: &dyn AnyMessage) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn AnyMessage>>;
}

struct TypedCodec<T, S> {
    serializer: S,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BusMessage, S: MessageSerializer> ErasedCodec for TypedCodec<T, S> {
    fn message_type(&self) -> MessageType {
        MessageType::of::<T>()
    }

    fn encode(&self, message: &dyn AnyMessage) -> Result<Vec<u8>> {
        let typed = message.downcast_ref::<T>().ok_or_else(|| {
            BusError::serialization(format!(
                "codec for '{}' received a '{}'",
                T::TYPE_NAME,
                message.runtime_type()
            ))
        })?;
        self.serializer.serialize(typed)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn AnyMessage>> {
        let message: T = self.serializer.deserialize(bytes)?;
        Ok(Arc::new(message))
    }
}

/// Bidirectional mapping between message types and wire type tags, plus body codecs
#[derive(Clone)]
pub struct MessageRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    content_type: &'static str,
    by_name: HashMap<&'static str, Arc<dyn ErasedCodec>>,
    by_type: HashMap<TypeId, &'static str>,
}

impl MessageRegistry {
    /// Start building a registry whose bodies use `serializer`
    pub fn builder<S: MessageSerializer>(serializer: S) -> MessageRegistryBuilder<S> {
        MessageRegistryBuilder {
            serializer,
            codecs: Vec::new(),
        }
    }

    /// Start building a registry with JSON bodies
    pub fn json() -> MessageRegistryBuilder<JsonSerializer> {
        Self::builder(JsonSerializer)
    }

    /// Content type of encoded bodies
    pub fn content_type(&self) -> &'static str {
        self.inner.content_type
    }

    /// Resolve a wire type tag to its message type
    pub fn resolve(&self, type_name: &str) -> Option<MessageType> {
        self.inner
            .by_name
            .get(type_name)
            .map(|codec| codec.message_type())
    }

    /// Whether the message type is registered
    pub fn contains(&self, message_type: &MessageType) -> bool {
        self.inner.by_type.contains_key(&message_type.type_id())
    }

    /// All registered message types
    pub fn message_types(&self) -> Vec<MessageType> {
        self.inner
            .by_name
            .values()
            .map(|codec| codec.message_type())
            .collect()
    }

    /// Encode a typed message body
    pub fn encode<T: BusMessage>(&self, message: &T) -> Result<Vec<u8>> {
        self.encode_any(message)
    }

    /// Encode a type-erased message body
    pub fn encode_any(&self, message: &dyn AnyMessage) -> Result<Vec<u8>> {
        let message_type = message.runtime_type();
        let name = self
            .inner
            .by_type
            .get(&message_type.type_id())
            .ok_or_else(|| BusError::unregistered(message_type.name()))?;
        let codec = self
            .inner
            .by_name
            .get(name)
            .ok_or_else(|| BusError::unregistered(message_type.name()))?;
        codec.encode(message)
    }

    /// Decode a body using the codec registered for `type_name`
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Arc<dyn AnyMessage>> {
        let codec = self
            .inner
            .by_name
            .get(type_name)
            .ok_or_else(|| BusError::unregistered(type_name))?;
        codec.decode(bytes)
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.inner.by_name.keys().collect();
        names.sort();
        f.debug_struct("MessageRegistry")
            .field("content_type", &self.inner.content_type)
            .field("types", &names)
            .finish()
    }
}

/// Builder for [`MessageRegistry`]
pub struct MessageRegistryBuilder<S: MessageSerializer> {
    serializer: S,
    codecs: Vec<Arc<dyn ErasedCodec>>,
}

impl<S: MessageSerializer> MessageRegistryBuilder<S> {
    /// Register a message type
    pub fn register<T: BusMessage>(mut self) -> Self {
        self.codecs.push(Arc::new(TypedCodec::<T, S> {
            serializer: self.serializer.clone(),
            _marker: PhantomData,
        }));
        self
    }

    /// Finish the registry, rejecting two distinct types sharing one tag
    pub fn build(self) -> Result<MessageRegistry> {
        let mut by_name: HashMap<&'static str, Arc<dyn ErasedCodec>> = HashMap::new();
        let mut by_type = HashMap::new();

        for codec in self.codecs {
            let message_type = codec.message_type();
            if let Some(existing) = by_name.get(message_type.name()) {
                if existing.message_type() != message_type {
                    return Err(BusError::configuration(format!(
                        "type name '{}' is registered by two different message types",
                        message_type.name()
                    )));
                }
                continue;
            }
            by_type.insert(message_type.type_id(), message_type.name());
            by_name.insert(message_type.name(), codec);
        }

        Ok(MessageRegistry {
            inner: Arc::new(RegistryInner {
                content_type: self.serializer.content_type(),
                by_name,
                by_type,
            }),
        })
    }
}
