//! Outbound work queue drained by a single publish worker
//!
//! Publish operations serialize the body, resolve the route and enqueue a
//! [`DeliveryFactory`]; they return immediately. The worker waits for the
//! "publishing enabled" gate, materializes each factory into a [`Delivery`]
//! against the live channel (so ids, reply-to and sequence numbers reflect the
//! connection at send time) and runs it through the publish modules.

use crate::connection::ConnectionObserver;
use crate::context::CurrentMessageInformation;
use crate::endpoint::{Endpoint, MessageId, ProducerId};
use crate::error::{BusError, Result};
use crate::ids::{IdGenerator, SequenceGenerator};
use crate::message::{BusMessage, MessageRegistry, MessageType};
use crate::modules::{DeliveryFailure, FailureCallback, PublishContext, PublishModule};
use crate::routing::{ExchangeResolver, routing_key};
use crate::transport::{
    BasicProperties, BasicPublish, Channel, ShutdownReason, TransportConnection, TransportResult,
    headers,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Supplies the local receive endpoint at send time
pub type EndpointProvider = Arc<dyn Fn() -> Endpoint + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryKind {
    Publish,
    PublishMandatory,
    Request,
    Send,
    Reply { correlation_id: MessageId },
}

impl DeliveryKind {
    fn mandatory(self) -> bool {
        !matches!(self, Self::Publish)
    }

    fn sequenced(self) -> bool {
        matches!(self, Self::Publish | Self::PublishMandatory | Self::Request)
    }
}

/// Deferred outbound work captured at enqueue time
pub struct DeliveryFactory {
    kind: DeliveryKind,
    message_type: MessageType,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    persistent: bool,
    on_failure: Option<FailureCallback>,
}

/// What a factory needs from the publishing process to build a delivery
struct DeliveryEnvironment<'a> {
    ids: &'a dyn IdGenerator,
    sequences: &'a dyn SequenceGenerator,
    producer: ProducerId,
    content_type: &'static str,
    reply_to: Endpoint,
}

impl DeliveryFactory {
    fn create(self, env: &DeliveryEnvironment<'_>) -> Delivery {
        let correlation_id = match self.kind {
            DeliveryKind::Request => env.ids.next(),
            DeliveryKind::Reply { correlation_id } => correlation_id,
            _ => MessageId::EMPTY,
        };

        let mut message_headers = HashMap::new();
        if self.kind.sequenced() {
            message_headers.insert(headers::PRODUCER_ID.to_string(), env.producer.to_string());
            message_headers.insert(
                headers::SEQUENCE.to_string(),
                env.sequences.next(&self.message_type).to_string(),
            );
        }

        let properties = BasicProperties {
            message_id: env.ids.next(),
            correlation_id,
            reply_to: env.reply_to.clone(),
            type_name: self.message_type.name().to_string(),
            content_type: env.content_type.to_string(),
            persistent: self.persistent,
            timestamp: Some(SystemTime::now()),
            headers: message_headers,
        };

        Delivery {
            message_type: self.message_type,
            publish: BasicPublish {
                exchange: self.exchange,
                routing_key: self.routing_key,
                mandatory: self.kind.mandatory(),
                properties,
                body: self.body,
            },
            on_failure: self.on_failure,
        }
    }
}

impl fmt::Debug for DeliveryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryFactory")
            .field("kind", &self.kind)
            .field("message_type", &self.message_type.name())
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

/// A materialized outbound delivery
#[derive(Debug)]
pub struct Delivery {
    message_type: MessageType,
    publish: BasicPublish,
    on_failure: Option<FailureCallback>,
}

impl Delivery {
    pub fn message_id(&self) -> MessageId {
        self.publish.properties.message_id
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.publish.properties
    }

    /// Run the delivery through the modules and hand it to the channel
    async fn execute(
        &self,
        channel: &Arc<dyn Channel>,
        modules: &dyn PublishModule,
    ) -> TransportResult<()> {
        modules.before_publish(&PublishContext {
            message_id: self.message_id(),
            type_name: self.message_type.name(),
            mandatory: self.publish.mandatory,
            publish_seq_no: channel.next_publish_seq_no(),
            on_failure: self.on_failure.as_ref(),
        });
        channel.basic_publish(self.publish.clone()).await
    }
}

/// Single-worker outbound pipeline
pub struct PublishingProcess {
    queue_tx: mpsc::UnboundedSender<DeliveryFactory>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryFactory>>>,
    enabled: watch::Sender<bool>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    registry: MessageRegistry,
    resolver: Arc<dyn ExchangeResolver>,
    ids: Arc<dyn IdGenerator>,
    sequences: Arc<dyn SequenceGenerator>,
    producer: ProducerId,
    local_endpoint: EndpointProvider,
    modules: Arc<dyn PublishModule>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl PublishingProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: MessageRegistry,
        resolver: Arc<dyn ExchangeResolver>,
        ids: Arc<dyn IdGenerator>,
        sequences: Arc<dyn SequenceGenerator>,
        producer: ProducerId,
        local_endpoint: EndpointProvider,
        modules: Arc<dyn PublishModule>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (enabled, _) = watch::channel(false);
        Self {
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            enabled,
            channel: RwLock::new(None),
            registry,
            resolver,
            ids,
            sequences,
            producer,
            local_endpoint,
            modules,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn producer_id(&self) -> ProducerId {
        self.producer
    }

    pub fn is_publishing_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Start the publish worker; later calls do nothing
    pub fn start(self: &Arc<Self>) {
        let Some(queue) = self.queue_rx.lock().take() else {
            return;
        };
        self.modules.initialize();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(queue).await });
        *self.task.lock() = Some(handle);
    }

    async fn run(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<DeliveryFactory>) {
        loop {
            let factory = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                factory = queue.recv() => match factory {
                    Some(factory) => factory,
                    None => break,
                },
            };

            let Some(channel) = self.wait_for_channel().await else {
                debug!("Cancelled while waiting for publishing to be enabled");
                break;
            };

            let delivery = factory.create(&DeliveryEnvironment {
                ids: self.ids.as_ref(),
                sequences: self.sequences.as_ref(),
                producer: self.producer,
                content_type: self.registry.content_type(),
                reply_to: (self.local_endpoint)(),
            });

            debug!(
                message_id = %delivery.message_id(),
                message_type = %delivery.message_type,
                exchange = %delivery.publish.exchange,
                routing_key = %delivery.publish.routing_key,
                "Executing delivery"
            );

            if let Err(e) = delivery.execute(&channel, self.modules.as_ref()).await {
                if e.is_channel_failure() {
                    error!(message_id = %delivery.message_id(), error = %e, "Channel failure while publishing, delivery dropped");
                } else {
                    error!(message_id = %delivery.message_id(), error = %e, "Publish failed, delivery dropped");
                }
                if let Some(callback) = &delivery.on_failure {
                    callback.fire(DeliveryFailure::ChannelError(e.to_string()));
                }
            }
        }
        debug!("Publish worker stopped");
    }

    /// Block until publishing is enabled with a live channel, or cancellation
    async fn wait_for_channel(&self) -> Option<Arc<dyn Channel>> {
        let mut enabled = self.enabled.subscribe();
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                result = enabled.wait_for(|enabled| *enabled) => {
                    if result.is_err() {
                        return None;
                    }
                }
            }
            if let Some(channel) = self.channel.read().clone() {
                return Some(channel);
            }
            if enabled.changed().await.is_err() {
                return None;
            }
        }
    }

    fn enqueue(&self, factory: DeliveryFactory) {
        if self.disposed.load(Ordering::SeqCst) {
            error!(delivery = ?factory, "Could not enqueue delivery, publishing process has been disposed of");
            return;
        }
        debug!(delivery = ?factory, "Enqueuing delivery");
        if let Err(e) = self.queue_tx.send(factory) {
            error!(delivery = ?e.0, "Could not enqueue delivery, publish queue is closed");
        }
    }

    fn prepare<T: BusMessage>(&self, message: &T) -> Result<(MessageType, String, Vec<u8>)> {
        let message_type = T::message_type();
        if !self.registry.contains(&message_type) {
            return Err(BusError::unregistered(message_type.name()));
        }
        let exchange = self.resolver.resolve(&message_type)?;
        let body = self.registry.encode(message)?;
        Ok((message_type, exchange, body))
    }

    /// Publish to every subscriber of the message type
    pub fn publish<T: BusMessage>(&self, message: &T, persistent: bool) -> Result<()> {
        let (message_type, exchange, body) = self.prepare(message)?;
        self.enqueue(DeliveryFactory {
            kind: DeliveryKind::Publish,
            message_type,
            exchange,
            routing_key: routing_key(&message_type).to_string(),
            body,
            persistent,
            on_failure: None,
        });
        Ok(())
    }

    /// Publish requiring at least one subscriber
    pub fn publish_mandatory<T: BusMessage>(
        &self,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        let (message_type, exchange, body) = self.prepare(message)?;
        self.enqueue(DeliveryFactory {
            kind: DeliveryKind::PublishMandatory,
            message_type,
            exchange,
            routing_key: routing_key(&message_type).to_string(),
            body,
            persistent,
            on_failure,
        });
        Ok(())
    }

    /// Publish a request carrying a fresh correlation id
    pub fn request<T: BusMessage>(
        &self,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        let (message_type, exchange, body) = self.prepare(message)?;
        self.enqueue(DeliveryFactory {
            kind: DeliveryKind::Request,
            message_type,
            exchange,
            routing_key: routing_key(&message_type).to_string(),
            body,
            persistent,
            on_failure,
        });
        Ok(())
    }

    /// Send directly to one endpoint
    pub fn send<T: BusMessage>(
        &self,
        recipient: &Endpoint,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        if recipient.is_empty() {
            return Err(BusError::invalid_operation(
                "send requires a non-empty recipient endpoint",
            ));
        }
        let (message_type, exchange, body) = self.prepare(message)?;
        self.enqueue(DeliveryFactory {
            kind: DeliveryKind::Send,
            message_type,
            exchange,
            routing_key: recipient.queue().to_string(),
            body,
            persistent,
            on_failure,
        });
        Ok(())
    }

    /// Reply to `request` on the exchange it arrived on
    pub fn reply<T: BusMessage>(
        &self,
        message: &T,
        request: &CurrentMessageInformation,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        if let Err(e) = request.ensure_request() {
            error!("Reply invoked out of the context of a message handling request");
            return Err(e);
        }

        let message_type = T::message_type();
        if !self.registry.contains(&message_type) {
            return Err(BusError::unregistered(message_type.name()));
        }
        let exchange = if request.exchange.is_empty() {
            self.resolver.resolve(&request.message_type)?
        } else {
            request.exchange.clone()
        };
        let body = self.registry.encode(message)?;

        self.enqueue(DeliveryFactory {
            kind: DeliveryKind::Reply {
                correlation_id: request.correlation_id,
            },
            message_type,
            exchange,
            routing_key: request.endpoint.queue().to_string(),
            body,
            persistent,
            on_failure,
        });
        Ok(())
    }

    /// Stop the worker; enqueued deliveries not yet sent are dropped
    ///
    /// Calling this more than once has no further effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Publish worker join error");
        }
        self.enabled.send_replace(false);
        *self.channel.write() = None;
        debug!("Publishing process disposed");
    }
}

#[async_trait]
impl ConnectionObserver for PublishingProcess {
    async fn connection_established(&self, connection: &Arc<dyn TransportConnection>) -> Result<()> {
        let channel = connection.create_channel().await?;
        self.modules.before_publish_enabled(&channel).await?;
        *self.channel.write() = Some(channel);
        self.enabled.send_replace(true);
        debug!("Publishing is enabled");
        Ok(())
    }

    async fn unexpected_shutdown(&self, _reason: &ShutdownReason) {
        warn!("Disabling publishing due to unexpected connection shutdown");
        self.enabled.send_replace(false);
        *self.channel.write() = None;
        self.modules.after_publish_disabled().await;
    }

    async fn graceful_shutdown(&self, _reason: &ShutdownReason) {
        self.enabled.send_replace(false);
        *self.channel.write() = None;
        debug!("Publishing disabled after graceful shutdown");
    }
}

impl fmt::Debug for PublishingProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishingProcess")
            .field("producer", &self.producer)
            .field("enabled", &self.is_publishing_enabled())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::connection::ReliableConnection;
    use crate::ids::{IncrementalSequenceGenerator, RandomIdGenerator};
    use crate::modules::{BasicReturnModule, PublishModuleCollection};
    use crate::routing::DefaultExchangeResolver;
    use crate::transport::memory::InMemoryBroker;
    use crate::transport::{InboundDelivery, QueueDeclare, Transport};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Announcement(String);

    impl BusMessage for Announcement {
        const TYPE_NAME: &'static str = "news.announcement";
        const EXCHANGE: Option<&'static str> = Some("news");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unregistered;

    impl BusMessage for Unregistered {
        const TYPE_NAME: &'static str = "news.unregistered";
        const EXCHANGE: Option<&'static str> = Some("news");
    }

    struct Harness {
        broker: InMemoryBroker,
        connection: Arc<ReliableConnection>,
        publisher: Arc<PublishingProcess>,
    }

    fn harness() -> Harness {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ReliableConnection::new(
            Arc::new(broker.clone()),
            Duration::from_millis(100),
        ));
        let registry = MessageRegistry::json()
            .register::<Announcement>()
            .build()
            .unwrap();
        let mut modules = PublishModuleCollection::new();
        modules.add_last(Arc::new(BasicReturnModule::new(Duration::from_secs(60))));

        let publisher = Arc::new(PublishingProcess::new(
            registry,
            Arc::new(DefaultExchangeResolver),
            Arc::new(RandomIdGenerator),
            Arc::new(IncrementalSequenceGenerator::new()),
            ProducerId::new_random(),
            Arc::new(|| Endpoint::new("amq.gen-local")),
            Arc::new(modules),
        ));
        connection.add_observer(Arc::clone(&publisher) as Arc<dyn ConnectionObserver>);
        publisher.start();
        Harness {
            broker,
            connection,
            publisher,
        }
    }

    struct Listener {
        _connection: Arc<dyn TransportConnection>,
        deliveries: mpsc::UnboundedReceiver<InboundDelivery>,
    }

    impl Listener {
        async fn next(&mut self) -> InboundDelivery {
            tokio::time::timeout(Duration::from_secs(1), self.deliveries.recv())
                .await
                .expect("no delivery within a second")
                .expect("delivery stream closed")
        }
    }

    async fn listen(broker: &InMemoryBroker, pattern: &str) -> Listener {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let queue = channel
            .queue_declare(QueueDeclare::default())
            .await
            .unwrap()
            .queue;
        channel.queue_bind(&queue, "news", pattern).await.unwrap();
        let deliveries = channel.basic_consume(&queue, false).await.unwrap();
        Listener {
            _connection: connection,
            deliveries,
        }
    }

    #[tokio::test]
    async fn test_messages_wait_for_the_connection() {
        let h = harness();
        let mut listener = listen(&h.broker, "#").await;

        h.publisher
            .publish(&Announcement("first".into()), true)
            .unwrap();
        assert!(!h.publisher.is_publishing_enabled());

        h.connection.connect().await.unwrap();
        let delivery = listener.next().await;

        let properties = &delivery.properties;
        assert_eq!(delivery.routing_key, "news.announcement");
        assert_eq!(properties.type_name, "news.announcement");
        assert_eq!(properties.content_type, "application/json");
        assert_eq!(properties.reply_to, Endpoint::new("amq.gen-local"));
        assert!(properties.persistent);
        assert!(properties.correlation_id.is_empty());
        assert_eq!(properties.header(headers::SEQUENCE), Some("1"));
        assert_eq!(
            properties.header(headers::PRODUCER_ID),
            Some(h.publisher.producer_id().to_string().as_str())
        );

        h.publisher.dispose().await;
        h.connection.dispose().await;
    }

    #[tokio::test]
    async fn test_request_carries_correlation_id() {
        let h = harness();
        let mut listener = listen(&h.broker, "news.*").await;
        h.connection.connect().await.unwrap();

        h.publisher
            .request(&Announcement("question".into()), None, false)
            .unwrap();
        let delivery = listener.next().await;
        assert!(!delivery.properties.correlation_id.is_empty());
        assert!(!delivery.properties.persistent);

        h.publisher.dispose().await;
        h.connection.dispose().await;
    }

    #[tokio::test]
    async fn test_send_to_missing_endpoint_reports_return() {
        let h = harness();
        h.connection.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback = FailureCallback::new(move |failure| {
            let _ = tx.send(failure);
        });
        h.publisher
            .send(
                &Endpoint::new("nobody-home"),
                &Announcement("hello?".into()),
                Some(callback),
                true,
            )
            .unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(failure, DeliveryFailure::Returned(ref r) if r.routing_key == "nobody-home"));

        h.publisher.dispose().await;
        h.connection.dispose().await;
    }

    #[tokio::test]
    async fn test_protocol_misuse_fails_synchronously() {
        let h = harness();

        assert!(matches!(
            h.publisher.publish(&Unregistered, true),
            Err(BusError::UnregisteredMessageType(_))
        ));
        assert!(
            h.publisher
                .send(&Endpoint::empty(), &Announcement("x".into()), None, true)
                .unwrap_err()
                .is_invalid_operation()
        );

        let not_a_request =
            CurrentMessageInformation::local(Arc::new(Announcement("plain".into())));
        let result = h
            .publisher
            .reply(&Announcement("answer".into()), &not_a_request, None, true);
        assert!(result.unwrap_err().is_invalid_operation());

        h.publisher.dispose().await;
    }

    #[traced_test]
    #[tokio::test]
    async fn test_enqueue_after_dispose_is_logged_not_raised() {
        let h = harness();
        h.publisher.dispose().await;
        h.publisher.dispose().await;

        assert!(
            h.publisher
                .publish(&Announcement("late".into()), true)
                .is_ok()
        );
        assert!(logs_contain("publishing process has been disposed of"));
    }
}
