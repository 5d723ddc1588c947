//! The message bus facade
//!
//! [`MessageBus`] wires a [`ReliableConnection`] to one consuming and one
//! publishing process. The consuming process observes the connection first, so
//! on every (re)connection the receive queue and its bindings are in place
//! before the publishing gate opens.
//!
//! ```rust,no_run
//! use daemoneye_msgbus::{BusMessage, InMemoryBroker, MessageBus, MessageRegistry};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ScanCompleted {
//!     findings: u32,
//! }
//!
//! impl BusMessage for ScanCompleted {
//!     const TYPE_NAME: &'static str = "scans.completed";
//!     const EXCHANGE: Option<&'static str> = Some("scans");
//! }
//!
//! # async fn run() -> daemoneye_msgbus::Result<()> {
//! let registry = MessageRegistry::json().register::<ScanCompleted>().build()?;
//! let bus = MessageBus::builder(Arc::new(InMemoryBroker::new()))
//!     .registry(registry)
//!     .build()?;
//!
//! bus.start().await?;
//! bus.publish(&ScanCompleted { findings: 3 }, true)?;
//! bus.dispose().await;
//! # Ok(())
//! # }
//! ```

use crate::config::BusOptions;
use crate::connection::{ConnectionObserver, ReliableConnection};
use crate::consumer::{Consumer, ConsumerContainer, EmptyConsumerContainer, SubscriptionHandle};
use crate::consuming::ConsumingProcess;
use crate::context::CurrentMessageInformation;
use crate::endpoint::{Endpoint, ProducerId};
use crate::error::{BusError, REPLY_OUT_OF_REQUEST_CONTEXT, Result};
use crate::filters::{MessageFilter, MessageFilterCollection, ResequencingDeduplicationFilter};
use crate::ids::{IdGenerator, IncrementalSequenceGenerator, RandomIdGenerator, SequenceGenerator};
use crate::message::{BusMessage, MessageRegistry};
use crate::modules::{
    BasicReturnModule, FailureCallback, PublishModule, PublishModuleCollection,
    PublisherConfirmsModule,
};
use crate::publishing::PublishingProcess;
use crate::routing::{DefaultExchangeResolver, ExchangeResolver};
use crate::transport::{ShutdownReason, Transport, TransportConnection};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Bus lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// Connected, queue bound and publishing enabled
    Started,
    /// The connection dropped; the bus is reconnecting
    Interrupted,
    /// The bus was disposed of
    Stopped,
}

/// Last connection observer, translating transitions into [`BusEvent`]s
struct EventForwarder {
    events: broadcast::Sender<BusEvent>,
}

#[async_trait]
impl ConnectionObserver for EventForwarder {
    async fn connection_established(&self, _connection: &Arc<dyn TransportConnection>) -> Result<()> {
        let _ = self.events.send(BusEvent::Started);
        Ok(())
    }

    async fn unexpected_shutdown(&self, _reason: &ShutdownReason) {
        let _ = self.events.send(BusEvent::Interrupted);
    }
}

/// Builder for [`MessageBus`]
pub struct MessageBusBuilder {
    transport: Arc<dyn Transport>,
    registry: Option<MessageRegistry>,
    container: Arc<dyn ConsumerContainer>,
    resolver: Arc<dyn ExchangeResolver>,
    ids: Arc<dyn IdGenerator>,
    sequences: Arc<dyn SequenceGenerator>,
    filters: MessageFilterCollection,
    modules: PublishModuleCollection,
    options: BusOptions,
}

impl MessageBusBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: None,
            container: Arc::new(EmptyConsumerContainer),
            resolver: Arc::new(DefaultExchangeResolver),
            ids: Arc::new(RandomIdGenerator),
            sequences: Arc::new(IncrementalSequenceGenerator::new()),
            filters: MessageFilterCollection::new(),
            modules: PublishModuleCollection::new(),
            options: BusOptions::default(),
        }
    }

    /// Message types and body codec; required
    pub fn registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn container(mut self, container: Arc<dyn ConsumerContainer>) -> Self {
        self.container = container;
        self
    }

    pub fn exchange_resolver(mut self, resolver: Arc<dyn ExchangeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn sequence_generator(mut self, sequences: Arc<dyn SequenceGenerator>) -> Self {
        self.sequences = sequences;
        self
    }

    /// Append an inbound filter; the resequencer, when enabled, always runs first
    pub fn filter(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.filters.add_last(filter);
        self
    }

    /// Append an outbound module, after the built-in ones
    pub fn module(mut self, module: Arc<dyn PublishModule>) -> Self {
        self.modules.add_last(module);
        self
    }

    pub fn options(mut self, options: BusOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the options and wire the bus
    pub fn build(self) -> Result<MessageBus> {
        let registry = self
            .registry
            .ok_or_else(|| BusError::configuration("a message registry is required"))?;
        self.options
            .validate()
            .map_err(|e| BusError::configuration(e.to_string()))?;
        let options = self.options;

        let mut filters = self.filters;
        if options.deduplication_and_resequencing {
            filters.add_first(Arc::new(ResequencingDeduplicationFilter::new(
                options.resequencing_gap_timeout(),
                options.resequencing_max_pending,
            )));
        }

        let mut modules = self.modules;
        modules.add_first(Arc::new(BasicReturnModule::new(
            options.return_callback_retention(),
        )));
        if options.use_publisher_confirms {
            modules.add_first(Arc::new(PublisherConfirmsModule::new(
                options.publisher_confirm_timeout(),
                options.publisher_confirm_check_interval(),
            )));
        }
        let modules = Arc::new(modules);

        let (endpoint, endpoint_provider) = ConsumingProcess::shared_endpoint();
        let publisher = Arc::new(PublishingProcess::new(
            registry.clone(),
            Arc::clone(&self.resolver),
            self.ids,
            self.sequences,
            ProducerId::new_random(),
            endpoint_provider,
            Arc::clone(&modules) as Arc<dyn PublishModule>,
        ));
        let consumer = Arc::new(ConsumingProcess::new(
            &options,
            registry,
            self.resolver,
            self.container,
            Arc::new(filters),
            Arc::clone(&publisher),
            endpoint,
        ));

        let (events, _) = broadcast::channel(16);
        let connection = Arc::new(ReliableConnection::new(
            self.transport,
            options.connection_attempt_interval(),
        ));
        connection.add_observer(Arc::clone(&consumer) as Arc<dyn ConnectionObserver>);
        connection.add_observer(Arc::clone(&publisher) as Arc<dyn ConnectionObserver>);
        connection.add_observer(Arc::new(EventForwarder {
            events: events.clone(),
        }));

        Ok(MessageBus {
            connection,
            publisher,
            consumer,
            modules,
            events,
            options,
            disposed: AtomicBool::new(false),
        })
    }
}

impl fmt::Debug for MessageBusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBusBuilder")
            .field("registry", &self.registry)
            .field("filters", &self.filters)
            .field("modules", &self.modules)
            .field("options", &self.options)
            .finish()
    }
}

/// Resilient broker-backed message bus
pub struct MessageBus {
    connection: Arc<ReliableConnection>,
    publisher: Arc<PublishingProcess>,
    consumer: Arc<ConsumingProcess>,
    modules: Arc<PublishModuleCollection>,
    events: broadcast::Sender<BusEvent>,
    options: BusOptions,
    disposed: AtomicBool,
}

impl MessageBus {
    pub fn builder(transport: Arc<dyn Transport>) -> MessageBusBuilder {
        MessageBusBuilder::new(transport)
    }

    /// Start the workers and wait for the first connection
    ///
    /// Connection attempts are retried every
    /// [`connection_attempt_interval`](Self::connection_attempt_interval)
    /// until one succeeds or the bus is disposed of.
    pub async fn start(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::disposed("message bus"));
        }
        self.consumer.start();
        self.publisher.start();
        self.connection.connect().await?;
        info!(endpoint = %self.local_endpoint(), "Message bus started");
        Ok(())
    }

    /// Start in the background
    pub fn spawn_start(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.start().await })
    }

    /// Receive queue of this bus, empty before the first connection
    pub fn local_endpoint(&self) -> Endpoint {
        self.consumer.local_endpoint()
    }

    /// The message being dispatched on the calling task, if any
    pub fn current_message(&self) -> Option<Arc<CurrentMessageInformation>> {
        self.consumer.current_message()
    }

    pub fn connection_attempt_interval(&self) -> Duration {
        self.connection.connection_attempt_interval()
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Publish to every subscriber of the message type
    pub fn publish<T: BusMessage>(&self, message: &T, persistent: bool) -> Result<()> {
        self.publisher.publish(message, persistent)
    }

    /// Publish a request; consumers answer with [`reply`](Self::reply)
    pub fn request<T: BusMessage>(
        &self,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        self.publisher.request(message, on_failure, persistent)
    }

    /// Send to one endpoint; `on_failure` fires if nothing is bound to it
    pub fn send<T: BusMessage>(
        &self,
        recipient: &Endpoint,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        self.publisher
            .send(recipient, message, on_failure, persistent)
    }

    /// Publish requiring at least one subscriber
    pub fn publish_mandatory<T: BusMessage>(
        &self,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        self.publisher
            .publish_mandatory(message, on_failure, persistent)
    }

    /// Reply to the request being dispatched on the calling task
    ///
    /// Fails with an invalid-operation error outside of a request dispatch.
    pub fn reply<T: BusMessage>(
        &self,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        let current = self
            .current_message()
            .ok_or_else(|| BusError::invalid_operation(REPLY_OUT_OF_REQUEST_CONTEXT))?;
        self.publisher
            .reply(message, &current, on_failure, persistent)
    }

    /// Dispatch a message to local consumers without the broker
    pub async fn consume<T: BusMessage>(&self, message: T) {
        self.consumer.consume(message).await;
    }

    /// Subscribe a caller-owned consumer; dropping the handle unsubscribes
    pub async fn add_instance_subscription(
        &self,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle> {
        self.consumer.add_instance_subscription(consumer).await
    }

    /// Stop publishing and consuming, then close the connection
    ///
    /// Calling this more than once has no further effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Disposing message bus");
        self.publisher.dispose().await;
        self.consumer.dispose().await;
        self.modules.dispose().await;
        self.connection.dispose().await;
        let _ = self.events.send(BusEvent::Stopped);
        info!("Message bus stopped");
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("endpoint", &self.local_endpoint())
            .field("connection", &self.connection)
            .field("publisher", &self.publisher)
            .field("consumer", &self.consumer)
            .finish()
    }
}
