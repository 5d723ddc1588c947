//! # DaemonEye Message Bus
//!
//! A resilient client-side message bus over an AMQP-style broker: topic
//! exchanges, queues, bindings, manual acknowledgement, mandatory returns and
//! publisher confirms.
//!
//! ## Features
//!
//! - **Reliable connection**: constant-interval reconnection with ordered lifecycle observers
//! - **Fire-and-forget publishing**: a single publish worker gated on connection health,
//!   failures reported through opt-in callbacks
//! - **Typed consumers**: container and instance subscriptions, bound automatically
//! - **Request/reply**: correlation ids and a task-local current message
//! - **Deduplication and resequencing**: per-producer ordering on the inbound path
//! - **In-memory broker**: a complete in-process transport for local use and tests
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use daemoneye_msgbus::{
//!     BusMessage, Consumer, InMemoryBroker, MessageBus, MessageContext, MessageRegistry,
//!     MessageType,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ProcessStarted {
//!     pid: u32,
//! }
//!
//! impl BusMessage for ProcessStarted {
//!     const TYPE_NAME: &'static str = "process.started";
//!     const EXCHANGE: Option<&'static str> = Some("process");
//! }
//!
//! struct Auditor;
//!
//! #[async_trait]
//! impl Consumer for Auditor {
//!     fn supported_types(&self) -> Vec<MessageType> {
//!         vec![ProcessStarted::message_type()]
//!     }
//!
//!     async fn consume(&self, context: &MessageContext) -> anyhow::Result<()> {
//!         if let Some(event) = context.message::<ProcessStarted>() {
//!             tracing::info!(pid = event.pid, "process started");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = MessageRegistry::json()
//!         .register::<ProcessStarted>()
//!         .build()?;
//!     let bus = MessageBus::builder(Arc::new(InMemoryBroker::new()))
//!         .registry(registry)
//!         .build()?;
//!     bus.start().await?;
//!
//!     let auditor: Arc<dyn Consumer> = Arc::new(Auditor);
//!     let _subscription = bus.add_instance_subscription(Arc::clone(&auditor)).await?;
//!     bus.publish(&ProcessStarted { pid: 1234 }, true)?;
//!
//!     bus.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod consuming;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod filters;
pub mod ids;
pub mod message;
pub mod modules;
pub mod publishing;
pub mod queue;
pub mod routing;
pub mod serializer;
pub mod transport;

// Re-export main types for convenience
pub use bus::{BusEvent, MessageBus, MessageBusBuilder};
pub use config::{BusOptions, ConfigError, OptionsLoader};
pub use connection::{ConnectionEvent, ConnectionObserver, ConnectionState, ReliableConnection};
pub use consumer::{
    Consumer, ConsumerContainer, EmptyConsumerContainer, SimpleConsumerContainer,
    SubscriptionHandle,
};
pub use consuming::ConsumingProcess;
pub use context::{CurrentMessageInformation, MessageContext, current_message};
pub use endpoint::{DeliveryTag, Endpoint, MessageId, ProducerId};
pub use error::{BusError, Result};
pub use filters::{
    FilterOutcome, MessageFilter, MessageFilterCollection, ResequencingDeduplicationFilter,
};
pub use ids::{IdGenerator, IncrementalSequenceGenerator, RandomIdGenerator, SequenceGenerator};
pub use message::{AnyMessage, BusMessage, MessageRegistry, MessageRegistryBuilder, MessageType};
pub use modules::{
    BasicReturnModule, DeliveryFailure, FailureCallback, PublishContext, PublishModule,
    PublishModuleCollection, PublisherConfirmsModule,
};
pub use publishing::{Delivery, DeliveryFactory, PublishingProcess};
pub use queue::QueueFactory;
pub use routing::{
    Binding, BindingSet, DefaultExchangeResolver, ExchangeResolver, StaticExchangeResolver,
};
pub use serializer::{BincodeSerializer, JsonSerializer, MessageSerializer};
pub use transport::memory::InMemoryBroker;
pub use transport::{Channel, Transport, TransportConnection, TransportError};
