//! Inbound path: receive queue, bindings and the dispatch worker
//!
//! On every connection establishment the receive queue is (re)declared under
//! its previously assigned name, bound for every message type a consumer
//! handles, and consumed with manual acknowledgement. A forwarding task per
//! channel feeds a single dispatch worker, so deliveries are handled strictly
//! in arrival order across reconnects.

use crate::config::BusOptions;
use crate::connection::ConnectionObserver;
use crate::consumer::{Consumer, ConsumerContainer, InstanceRegistry, SubscriptionHandle};
use crate::context::{
    Acknowledgement, CurrentMessageInformation, MessageContext, with_current_message,
};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::filters::{FilterOutcome, MessageFilter};
use crate::message::{BusMessage, MessageRegistry};
use crate::publishing::{EndpointProvider, PublishingProcess};
use crate::queue::QueueFactory;
use crate::routing::{BindingSet, ExchangeResolver};
use crate::transport::{Channel, InboundDelivery, ShutdownReason, TransportConnection};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lower bound on how often held messages are checked for expiry
const MIN_FILTER_EXPIRY_INTERVAL: Duration = Duration::from_millis(10);

type Inbound = (Arc<dyn Channel>, InboundDelivery);

/// Receives, filters and dispatches inbound deliveries
pub struct ConsumingProcess {
    registry: MessageRegistry,
    resolver: Arc<dyn ExchangeResolver>,
    container: Arc<dyn ConsumerContainer>,
    instances: Arc<InstanceRegistry>,
    filters: Arc<dyn MessageFilter>,
    publisher: Arc<PublishingProcess>,
    queue_factory: QueueFactory,
    prefetch_count: Option<u16>,
    no_local: bool,
    filter_expiry_interval: Duration,
    endpoint: Arc<RwLock<Endpoint>>,
    bindings: Mutex<BindingSet>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    forwarder: Mutex<Option<CancellationToken>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ConsumingProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: &BusOptions,
        registry: MessageRegistry,
        resolver: Arc<dyn ExchangeResolver>,
        container: Arc<dyn ConsumerContainer>,
        filters: Arc<dyn MessageFilter>,
        publisher: Arc<PublishingProcess>,
        endpoint: Arc<RwLock<Endpoint>>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            resolver,
            container,
            instances: Arc::new(InstanceRegistry::default()),
            filters,
            publisher,
            queue_factory: QueueFactory::new(options),
            prefetch_count: options.prefetch_count,
            no_local: options.no_local,
            filter_expiry_interval: (options.resequencing_gap_timeout() / 4)
                .max(MIN_FILTER_EXPIRY_INTERVAL),
            endpoint,
            bindings: Mutex::new(BindingSet::default()),
            channel: RwLock::new(None),
            forwarder: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Endpoint cell shared with the publishing process as its reply-to source
    pub fn shared_endpoint() -> (Arc<RwLock<Endpoint>>, EndpointProvider) {
        let endpoint = Arc::new(RwLock::new(Endpoint::empty()));
        let reader = Arc::clone(&endpoint);
        (endpoint, Arc::new(move || reader.read().clone()))
    }

    /// Receive queue of this process, empty until the first connection
    pub fn local_endpoint(&self) -> Endpoint {
        self.endpoint.read().clone()
    }

    /// The message being dispatched on the calling task, if any
    pub fn current_message(&self) -> Option<Arc<CurrentMessageInformation>> {
        crate::context::current_message()
    }

    /// Bindings applied on the current channel
    pub fn bindings(&self) -> BindingSet {
        self.bindings.lock().clone()
    }

    /// Start the dispatch worker; later calls do nothing
    pub fn start(self: &Arc<Self>) {
        let Some(inbound) = self.inbound_rx.lock().take() else {
            return;
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(inbound).await });
        *self.task.lock() = Some(handle);
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        let mut expiry = tokio::time::interval(self.filter_expiry_interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                received = inbound.recv() => match received {
                    Some((channel, delivery)) => self.handle_delivery(channel, delivery).await,
                    None => break,
                },
                _ = expiry.tick() => {
                    let released = self.filters.expire(Instant::now());
                    if !released.is_empty() {
                        debug!(
                            deliver = released.deliver.len(),
                            discard = released.discard.len(),
                            "Filters released held messages"
                        );
                        self.process(released).await;
                    }
                }
            }
        }
        debug!("Dispatch worker stopped");
    }

    async fn handle_delivery(&self, channel: Arc<dyn Channel>, delivery: InboundDelivery) {
        let acknowledgement = Acknowledgement::new(channel, delivery.delivery_tag);
        let properties = delivery.properties;

        let Some(message_type) = self.registry.resolve(&properties.type_name) else {
            warn!(
                type_name = %properties.type_name,
                message_id = %properties.message_id,
                "Dropping delivery of unknown message type"
            );
            acknowledge(&acknowledgement).await;
            return;
        };

        let body = match self.registry.decode(&properties.type_name, &delivery.body) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    type_name = %properties.type_name,
                    message_id = %properties.message_id,
                    error = %e,
                    "Dropping undecodable delivery"
                );
                acknowledge(&acknowledgement).await;
                return;
            }
        };

        let information = CurrentMessageInformation {
            message_id: properties.message_id,
            message_type,
            endpoint: properties.reply_to,
            correlation_id: properties.correlation_id,
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            body,
            headers: properties.headers,
            redelivered: delivery.redelivered,
            acknowledgement: Some(acknowledgement),
        };

        let outcome = self.filters.filter(information, Instant::now());
        self.process(outcome).await;
    }

    async fn process(&self, outcome: FilterOutcome) {
        for discarded in outcome.discard {
            debug!(
                message_id = %discarded.message_id,
                message_type = %discarded.message_type,
                "Message suppressed by filter"
            );
            if let Some(acknowledgement) = &discarded.acknowledgement {
                acknowledge(acknowledgement).await;
            }
        }

        for delivered in outcome.deliver {
            let acknowledgement = delivered.acknowledgement.clone();
            self.dispatch(Arc::new(delivered)).await;
            if let Some(acknowledgement) = &acknowledgement {
                acknowledge(acknowledgement).await;
            }
        }
    }

    /// Run every consumer for `information`, instance consumers first
    async fn dispatch(&self, information: Arc<CurrentMessageInformation>) {
        let message_type = information.message_type;
        let context = MessageContext::new(Arc::clone(&information), Arc::clone(&self.publisher));

        with_current_message(information, async {
            let instance_consumers = self.instances.resolve(&message_type);
            let container_consumers = self.container.resolve(&message_type);
            if instance_consumers.is_empty() && container_consumers.is_empty() {
                debug!(message_type = %message_type, "No consumer for message");
            }

            for consumer in instance_consumers.iter().chain(container_consumers.iter()) {
                if let Err(e) = consumer.consume(&context).await {
                    error!(
                        message_type = %message_type,
                        message_id = %context.current().message_id,
                        error = %e,
                        "Consumer failed to handle message"
                    );
                }
            }

            self.container.release(container_consumers);
        })
        .await;
    }

    /// Dispatch a message locally without touching the transport
    ///
    /// Filters are skipped and nothing is acknowledged.
    pub async fn consume<T: BusMessage>(&self, message: T) {
        if self.disposed.load(Ordering::SeqCst) {
            error!(message = ?message, "Could not consume message, consuming process has been disposed of");
            return;
        }
        let information = CurrentMessageInformation::local(Arc::new(message));
        self.dispatch(Arc::new(information)).await;
    }

    /// Subscribe a caller-owned consumer without keeping it alive
    ///
    /// When connected, bindings the consumer needs that are not yet in place
    /// are added before this returns.
    pub async fn add_instance_subscription(
        &self,
        consumer: Arc<dyn Consumer>,
    ) -> Result<SubscriptionHandle> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::disposed("consuming process"));
        }

        let handle = SubscriptionHandle::new(self.instances.insert(&consumer), &self.instances);

        let channel = self.channel.read().clone();
        let Some(channel) = channel.filter(|channel| channel.is_open()) else {
            return Ok(handle);
        };

        let endpoint = self.local_endpoint();
        let required = BindingSet::compute(
            consumer.supported_types(),
            self.resolver.as_ref(),
            &endpoint,
        );
        let missing = required.difference(&self.bindings.lock());

        for binding in missing.iter() {
            if let Err(e) = channel
                .queue_bind(endpoint.queue(), &binding.exchange, &binding.routing_key)
                .await
            {
                // The binding is recomputed on the next connection anyway
                warn!(binding = %binding, error = %e, "Could not bind for instance subscription");
                return Ok(handle);
            }
            debug!(binding = %binding, "Bound for instance subscription");
        }
        self.bindings.lock().extend(missing);
        Ok(handle)
    }

    fn required_bindings(&self, endpoint: &Endpoint) -> BindingSet {
        let mut types = self.container.supported_types();
        for message_type in self.instances.supported_types() {
            if !types.contains(&message_type) {
                types.push(message_type);
            }
        }
        BindingSet::compute(types, self.resolver.as_ref(), endpoint)
    }

    fn spawn_forwarder(
        &self,
        channel: Arc<dyn Channel>,
        mut deliveries: mpsc::UnboundedReceiver<InboundDelivery>,
    ) {
        let token = self.cancel.child_token();
        if let Some(previous) = self.forwarder.lock().replace(token.clone()) {
            previous.cancel();
        }
        let inbound = self.inbound_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => {
                            if inbound.send((Arc::clone(&channel), delivery)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(channel = channel.id(), "Delivery forwarder stopped");
        });
    }

    fn stop_forwarder(&self) {
        if let Some(token) = self.forwarder.lock().take() {
            token.cancel();
        }
    }

    /// Stop dispatching and delete the receive queue if the channel is still open
    ///
    /// Calling this more than once has no further effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.stop_forwarder();

        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Dispatch worker join error");
        }

        let channel = self.channel.write().take();
        if let Some(channel) = channel
            && channel.is_open()
        {
            let endpoint = self.local_endpoint();
            if !endpoint.is_empty() {
                match channel.queue_delete(endpoint.queue()).await {
                    Ok(dropped) => debug!(queue = %endpoint, dropped, "Receive queue deleted"),
                    Err(e) => warn!(queue = %endpoint, error = %e, "Could not delete receive queue"),
                }
            }
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Consumer channel already closed");
            }
        }
        debug!("Consuming process disposed");
    }
}

async fn acknowledge(acknowledgement: &Acknowledgement) {
    if let Err(e) = acknowledgement.ack().await {
        // The broker requeues unacknowledged deliveries of a closed channel
        debug!(acknowledgement = ?acknowledgement, error = %e, "Could not acknowledge delivery");
    }
}

#[async_trait]
impl ConnectionObserver for ConsumingProcess {
    async fn connection_established(&self, connection: &Arc<dyn TransportConnection>) -> Result<()> {
        let channel = connection.create_channel().await?;
        if let Some(prefetch_count) = self.prefetch_count {
            channel.basic_qos(prefetch_count).await?;
        }

        let previous = self.local_endpoint();
        let endpoint = self.queue_factory.create(channel.as_ref(), &previous).await?;
        if !previous.is_empty() && previous != endpoint {
            warn!(previous = %previous, current = %endpoint, "Receive queue name changed");
        }
        *self.endpoint.write() = endpoint.clone();

        let bindings = self.required_bindings(&endpoint);
        for binding in bindings.iter() {
            channel
                .queue_bind(endpoint.queue(), &binding.exchange, &binding.routing_key)
                .await?;
        }
        let bound = bindings.len();
        *self.bindings.lock() = bindings;

        let deliveries = channel.basic_consume(endpoint.queue(), self.no_local).await?;
        *self.channel.write() = Some(Arc::clone(&channel));
        self.spawn_forwarder(channel, deliveries);

        info!(queue = %endpoint, bindings = bound, "Consuming from receive queue");
        Ok(())
    }

    async fn unexpected_shutdown(&self, _reason: &ShutdownReason) {
        *self.channel.write() = None;
        self.stop_forwarder();
    }

    async fn graceful_shutdown(&self, _reason: &ShutdownReason) {
        *self.channel.write() = None;
        self.stop_forwarder();
    }
}

impl fmt::Debug for ConsumingProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumingProcess")
            .field("endpoint", &self.local_endpoint())
            .field("instances", &self.instances.len())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::connection::ReliableConnection;
    use crate::consumer::SimpleConsumerContainer;
    use crate::endpoint::ProducerId;
    use crate::filters::MessageFilterCollection;
    use crate::ids::{IncrementalSequenceGenerator, RandomIdGenerator};
    use crate::message::MessageType;
    use crate::modules::PublishModuleCollection;
    use crate::routing::DefaultExchangeResolver;
    use crate::transport::memory::InMemoryBroker;
    use crate::transport::{BasicProperties, BasicPublish, Transport};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Reading(u32);

    impl BusMessage for Reading {
        const TYPE_NAME: &'static str = "sensors.reading";
        const EXCHANGE: Option<&'static str> = Some("sensors");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Calibrated;

    impl BusMessage for Calibrated {
        const TYPE_NAME: &'static str = "sensors.calibrated";
        const EXCHANGE: Option<&'static str> = Some("sensors");
    }

    struct Recorder {
        types: Vec<MessageType>,
        seen: mpsc::UnboundedSender<(&'static str, u32)>,
        name: &'static str,
    }

    #[async_trait]
    impl Consumer for Recorder {
        fn supported_types(&self) -> Vec<MessageType> {
            self.types.clone()
        }

        async fn consume(&self, context: &MessageContext) -> anyhow::Result<()> {
            let value = context.message::<Reading>().map_or(0, |reading| reading.0);
            self.seen.send((self.name, value))?;
            Ok(())
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        connection: Arc<ReliableConnection>,
        consumer: Arc<ConsumingProcess>,
    }

    fn harness(container: Arc<dyn ConsumerContainer>) -> Harness {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ReliableConnection::new(
            Arc::new(broker.clone()),
            Duration::from_millis(50),
        ));
        let registry = MessageRegistry::json()
            .register::<Reading>()
            .register::<Calibrated>()
            .build()
            .unwrap();
        let resolver: Arc<dyn ExchangeResolver> = Arc::new(DefaultExchangeResolver);
        let (endpoint, provider) = ConsumingProcess::shared_endpoint();

        let publisher = Arc::new(PublishingProcess::new(
            registry.clone(),
            Arc::clone(&resolver),
            Arc::new(RandomIdGenerator),
            Arc::new(IncrementalSequenceGenerator::new()),
            ProducerId::new_random(),
            provider,
            Arc::new(PublishModuleCollection::new()),
        ));
        let consumer = Arc::new(ConsumingProcess::new(
            &BusOptions::default(),
            registry,
            resolver,
            container,
            Arc::new(MessageFilterCollection::new()),
            publisher,
            endpoint,
        ));
        connection.add_observer(Arc::clone(&consumer) as Arc<dyn ConnectionObserver>);
        consumer.start();
        Harness {
            broker,
            connection,
            consumer,
        }
    }

    async fn publish_raw(broker: &InMemoryBroker, type_name: &str, body: &[u8]) {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel
            .basic_publish(BasicPublish {
                exchange: "sensors".into(),
                routing_key: type_name.into(),
                mandatory: false,
                properties: BasicProperties {
                    type_name: type_name.into(),
                    ..BasicProperties::default()
                },
                body: body.to_vec(),
            })
            .await
            .unwrap();
        connection.close().await.unwrap();
    }

    async fn next(seen: &mut mpsc::UnboundedReceiver<(&'static str, u32)>) -> (&'static str, u32) {
        tokio::time::timeout(Duration::from_secs(1), seen.recv())
            .await
            .expect("no dispatch within a second")
            .expect("recorder dropped")
    }

    #[tokio::test]
    async fn test_queue_is_declared_and_bound_on_connect() {
        let (tx, _seen) = mpsc::unbounded_channel();
        let container = Arc::new(SimpleConsumerContainer::new());
        container.register(Arc::new(Recorder {
            types: vec![Reading::message_type()],
            seen: tx,
            name: "container",
        }));
        let h = harness(container);

        assert!(h.consumer.local_endpoint().is_empty());
        h.connection.connect().await.unwrap();

        let endpoint = h.consumer.local_endpoint();
        assert!(h.broker.queue_exists(endpoint.queue()));
        let mut bindings = h.broker.bindings(endpoint.queue());
        bindings.sort();
        assert_eq!(
            bindings,
            vec![
                ("sensors".to_string(), endpoint.queue().to_string()),
                ("sensors".to_string(), "sensors.reading".to_string()),
            ]
        );

        h.consumer.dispose().await;
        assert!(!h.broker.queue_exists(endpoint.queue()));
        h.connection.dispose().await;
    }

    #[tokio::test]
    async fn test_instance_consumers_run_before_container_consumers() {
        let (tx, mut seen) = mpsc::unbounded_channel();
        let container = Arc::new(SimpleConsumerContainer::new());
        container.register(Arc::new(Recorder {
            types: vec![Reading::message_type()],
            seen: tx.clone(),
            name: "container",
        }));
        let h = harness(container);
        h.connection.connect().await.unwrap();

        let instance: Arc<dyn Consumer> = Arc::new(Recorder {
            types: vec![Reading::message_type()],
            seen: tx,
            name: "instance",
        });
        let _subscription = h
            .consumer
            .add_instance_subscription(Arc::clone(&instance))
            .await
            .unwrap();

        publish_raw(&h.broker, "sensors.reading", b"7").await;
        assert_eq!(next(&mut seen).await, ("instance", 7));
        assert_eq!(next(&mut seen).await, ("container", 7));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.broker.statistics().messages_acked, 1);

        h.consumer.dispose().await;
        h.connection.dispose().await;
    }

    #[tokio::test]
    async fn test_instance_subscription_binds_new_types_while_connected() {
        let h = harness(Arc::new(crate::consumer::EmptyConsumerContainer));
        h.connection.connect().await.unwrap();
        let queue = h.consumer.local_endpoint();
        assert!(h.broker.bindings(queue.queue()).is_empty());

        let (tx, mut seen) = mpsc::unbounded_channel();
        let instance: Arc<dyn Consumer> = Arc::new(Recorder {
            types: vec![Calibrated::message_type()],
            seen: tx,
            name: "instance",
        });
        let subscription = h
            .consumer
            .add_instance_subscription(Arc::clone(&instance))
            .await
            .unwrap();
        assert!(
            h.broker
                .bindings(queue.queue())
                .contains(&("sensors".to_string(), "sensors.calibrated".to_string()))
        );

        publish_raw(&h.broker, "sensors.calibrated", b"null").await;
        assert_eq!(next(&mut seen).await, ("instance", 0));

        subscription.cancel();
        publish_raw(&h.broker, "sensors.calibrated", b"null").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.try_recv().is_err());

        h.consumer.dispose().await;
        h.connection.dispose().await;
    }

    #[tokio::test]
    async fn test_unknown_and_undecodable_deliveries_are_acked_and_dropped() {
        let (tx, mut seen) = mpsc::unbounded_channel();
        let container = Arc::new(SimpleConsumerContainer::new());
        container.register(Arc::new(Recorder {
            types: vec![Reading::message_type()],
            seen: tx,
            name: "container",
        }));
        let h = harness(container);
        h.connection.connect().await.unwrap();

        // Catch-all binding so junk reaches the bus queue
        let queue = h.consumer.local_endpoint();
        let admin = h.broker.connect().await.unwrap();
        let channel = admin.create_channel().await.unwrap();
        channel.queue_bind(queue.queue(), "sensors", "#").await.unwrap();

        publish_raw(&h.broker, "sensors.mystery", b"{}").await;
        publish_raw(&h.broker, "sensors.reading", b"not json").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.broker.statistics().messages_acked, 2);
        assert!(seen.try_recv().is_err());

        admin.close().await.unwrap();
        h.consumer.dispose().await;
        h.connection.dispose().await;
    }

    #[tokio::test]
    async fn test_local_consume_bypasses_the_transport() {
        let (tx, mut seen) = mpsc::unbounded_channel();
        let container = Arc::new(SimpleConsumerContainer::new());
        container.register(Arc::new(Recorder {
            types: vec![Reading::message_type()],
            seen: tx,
            name: "container",
        }));
        let h = harness(container);

        h.consumer.consume(Reading(3)).await;
        assert_eq!(next(&mut seen).await, ("container", 3));
        assert_eq!(h.broker.statistics().messages_published, 0);

        h.consumer.dispose().await;
        h.consumer.dispose().await;
        h.consumer.consume(Reading(4)).await;
        assert!(seen.try_recv().is_err());
    }
}
