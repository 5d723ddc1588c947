//! Consumers, consumer containers and instance subscriptions

use crate::context::MessageContext;
use crate::message::MessageType;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Handles messages of the types it supports
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use daemoneye_msgbus::{BusMessage, Consumer, MessageContext, MessageType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Ping;
///
/// impl BusMessage for Ping {
///     const TYPE_NAME: &'static str = "health.ping";
///     const EXCHANGE: Option<&'static str> = Some("health");
/// }
///
/// struct PingConsumer;
///
/// #[async_trait]
/// impl Consumer for PingConsumer {
///     fn supported_types(&self) -> Vec<MessageType> {
///         vec![Ping::message_type()]
///     }
///
///     async fn consume(&self, context: &MessageContext) -> anyhow::Result<()> {
///         if let Some(ping) = context.message::<Ping>() {
///             tracing::info!(?ping, "ping received");
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Message types this consumer handles
    fn supported_types(&self) -> Vec<MessageType>;

    /// Handle one message; errors are logged and do not stop dispatch
    async fn consume(&self, context: &MessageContext) -> anyhow::Result<()>;

    fn supports(&self, message_type: &MessageType) -> bool {
        self.supported_types().contains(message_type)
    }
}

/// Supplies consumers per message type
pub trait ConsumerContainer: Send + Sync {
    /// Consumers for one dispatch of `message_type`
    fn resolve(&self, message_type: &MessageType) -> Vec<Arc<dyn Consumer>>;

    /// Hand consumers back after dispatch
    fn release(&self, _consumers: Vec<Arc<dyn Consumer>>) {}

    /// Every message type some consumer of this container handles
    fn supported_types(&self) -> Vec<MessageType>;
}

/// A container without consumers
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyConsumerContainer;

impl ConsumerContainer for EmptyConsumerContainer {
    fn resolve(&self, _message_type: &MessageType) -> Vec<Arc<dyn Consumer>> {
        Vec::new()
    }

    fn supported_types(&self) -> Vec<MessageType> {
        Vec::new()
    }
}

type ConsumerFactory = Box<dyn Fn() -> Arc<dyn Consumer> + Send + Sync>;

enum Registration {
    Shared(Arc<dyn Consumer>),
    Transient {
        types: Vec<MessageType>,
        factory: ConsumerFactory,
    },
}

/// Container holding shared consumers and per-dispatch consumer factories
#[derive(Default)]
pub struct SimpleConsumerContainer {
    registrations: RwLock<Vec<Registration>>,
}

impl SimpleConsumerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer shared by every dispatch
    pub fn register(&self, consumer: Arc<dyn Consumer>) -> &Self {
        self.registrations
            .write()
            .push(Registration::Shared(consumer));
        self
    }

    /// Register a factory creating a fresh consumer for every dispatch
    pub fn register_transient<F>(&self, types: Vec<MessageType>, factory: F) -> &Self
    where
        F: Fn() -> Arc<dyn Consumer> + Send + Sync + 'static,
    {
        self.registrations.write().push(Registration::Transient {
            types,
            factory: Box::new(factory),
        });
        self
    }
}

impl ConsumerContainer for SimpleConsumerContainer {
    fn resolve(&self, message_type: &MessageType) -> Vec<Arc<dyn Consumer>> {
        self.registrations
            .read()
            .iter()
            .filter_map(|registration| match registration {
                Registration::Shared(consumer) => consumer
                    .supports(message_type)
                    .then(|| Arc::clone(consumer)),
                Registration::Transient { types, factory } => {
                    types.contains(message_type).then(factory)
                }
            })
            .collect()
    }

    fn release(&self, consumers: Vec<Arc<dyn Consumer>>) {
        debug!(count = consumers.len(), "Releasing consumers");
    }

    fn supported_types(&self) -> Vec<MessageType> {
        let mut types = Vec::new();
        for registration in self.registrations.read().iter() {
            let supported = match registration {
                Registration::Shared(consumer) => consumer.supported_types(),
                Registration::Transient { types, .. } => types.clone(),
            };
            for message_type in supported {
                if !types.contains(&message_type) {
                    types.push(message_type);
                }
            }
        }
        types
    }
}

impl fmt::Debug for SimpleConsumerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleConsumerContainer")
            .field("registrations", &self.registrations.read().len())
            .finish()
    }
}

/// Caller-owned consumers subscribed directly, held without keeping them alive
#[derive(Default)]
pub(crate) struct InstanceRegistry {
    entries: RwLock<BTreeMap<u64, Weak<dyn Consumer>>>,
    next_id: AtomicU64,
}

impl InstanceRegistry {
    pub(crate) fn insert(&self, consumer: &Arc<dyn Consumer>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, Arc::downgrade(consumer));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    /// Live consumers in subscription order; dead entries are dropped
    pub(crate) fn live(&self) -> Vec<Arc<dyn Consumer>> {
        let mut dead = Vec::new();
        let live = self
            .entries
            .read()
            .iter()
            .filter_map(|(id, weak)| {
                let upgraded = weak.upgrade();
                if upgraded.is_none() {
                    dead.push(*id);
                }
                upgraded
            })
            .collect();

        if !dead.is_empty() {
            let mut entries = self.entries.write();
            for id in dead {
                entries.remove(&id);
            }
        }
        live
    }

    pub(crate) fn resolve(&self, message_type: &MessageType) -> Vec<Arc<dyn Consumer>> {
        self.live()
            .into_iter()
            .filter(|consumer| consumer.supports(message_type))
            .collect()
    }

    pub(crate) fn supported_types(&self) -> Vec<MessageType> {
        let mut types = Vec::new();
        for consumer in self.live() {
            for message_type in consumer.supported_types() {
                if !types.contains(&message_type) {
                    types.push(message_type);
                }
            }
        }
        types
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Keeps an instance subscription alive; dropping it unsubscribes
#[must_use = "dropping the handle cancels the subscription"]
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<InstanceRegistry>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, registry: &Arc<InstanceRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// Unsubscribe now
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade()
            && registry.remove(self.id)
        {
            debug!(subscription = self.id, "Instance subscription removed");
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}
