//! In-process topic exchange broker
//!
//! Implements the transport traits without any network: topic exchanges with
//! `*` and `#` wildcards, the nameless default exchange routing by queue name,
//! server-named queues, manual acknowledgement, mandatory returns and publisher
//! confirms. Fault injection hooks let tests stop the broker, force-close
//! connections and delete queues.

use super::{
    BasicProperties, BasicPublish, BasicReturn, Channel, ChannelEvent, InboundDelivery, NO_ROUTE,
    QueueArguments, QueueDeclare, QueueDeclareOk, ShutdownReason, Transport, TransportConnection,
    TransportError, TransportResult,
};
use crate::endpoint::DeliveryTag;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;
const ANONYMOUS_QUEUE_PREFIX: &str = "amq.gen-";

/// Whether a topic binding pattern matches a routing key
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = routing_key.split('.').collect();
    matches_parts(&pattern_parts, &key_parts)
}

fn matches_parts(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_parts(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_parts(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_parts(rest, &key[1..]),
    }
}

/// How the broker answers publishes on confirm-mode channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmBehavior {
    /// Route the message and ack it
    #[default]
    Ack,
    /// Drop the message and nack it
    Nack,
    /// Route the message and never confirm it
    Withhold,
}

/// Broker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatistics {
    pub connections_opened: u64,
    pub queue_declarations: u64,
    pub queue_binds: u64,
    pub messages_published: u64,
    pub messages_routed: u64,
    pub messages_returned: u64,
    pub messages_delivered: u64,
    pub messages_acked: u64,
}

/// Shared handle to an in-process broker
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    refusing: AtomicBool,
}

type ChannelKey = (u64, u16);

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<ExchangeBinding>>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<ChannelKey, ChannelState>,
    connections: HashMap<u64, Arc<ConnectionShared>>,
    next_connection_id: u64,
    confirm_behavior: ConfirmBehavior,
    stats: BrokerStatistics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExchangeBinding {
    queue: String,
    pattern: String,
}

struct QueueState {
    messages: VecDeque<StoredMessage>,
    consumer: Option<QueueConsumer>,
    arguments: QueueArguments,
    last_used: Instant,
}

struct QueueConsumer {
    channel: ChannelKey,
    no_local: bool,
    sender: mpsc::UnboundedSender<InboundDelivery>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
    publisher: u64,
    enqueued_at: Instant,
}

struct ChannelState {
    prefetch: Option<u16>,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    confirm_mode: bool,
    next_publish_seq: u64,
    events: broadcast::Sender<ChannelEvent>,
}

struct ConnectionShared {
    id: u64,
    shutdown: watch::Sender<Option<ShutdownReason>>,
    next_channel: AtomicU16,
}

impl InMemoryBroker {
    /// Create an empty broker accepting connections
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections and force-close the live ones
    pub fn stop(&self) {
        info!("Stopping in-memory broker");
        self.inner.refusing.store(true, Ordering::SeqCst);
        self.drop_connections();
    }

    /// Accept connections again
    pub fn start(&self) {
        info!("Starting in-memory broker");
        self.inner.refusing.store(false, Ordering::SeqCst);
    }

    /// Force-close every live connection, as a broker restart would
    pub fn drop_connections(&self) {
        let ids: Vec<u64> = self.inner.state.lock().connections.keys().copied().collect();
        for id in ids {
            self.inner.close_connection(
                id,
                ShutdownReason::forced("CONNECTION_FORCED - broker forced connection closure"),
            );
        }
    }

    /// Delete a queue and its bindings, as expiry would
    pub fn delete_queue(&self, queue: &str) -> Option<u32> {
        let mut state = self.inner.state.lock();
        state.remove_queue(queue)
    }

    /// Choose how publishes on confirm-mode channels are answered
    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.inner.state.lock().confirm_behavior = behavior;
    }

    /// Whether a queue currently exists
    pub fn queue_exists(&self, queue: &str) -> bool {
        let mut state = self.inner.state.lock();
        state.sweep_expired_queues(Instant::now());
        state.queues.contains_key(queue)
    }

    /// Names of every existing queue
    pub fn queue_names(&self) -> Vec<String> {
        let mut state = self.inner.state.lock();
        state.sweep_expired_queues(Instant::now());
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in a queue, excluding unacknowledged ones
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    /// (exchange, pattern) bindings of a queue
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        let state = self.inner.state.lock();
        let mut bindings: Vec<(String, String)> = state
            .exchanges
            .iter()
            .flat_map(|(exchange, bindings)| {
                bindings
                    .iter()
                    .filter(|b| b.queue == queue)
                    .map(move |b| (exchange.clone(), b.pattern.clone()))
            })
            .collect();
        bindings.sort();
        bindings
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Snapshot of the broker counters
    pub fn statistics(&self) -> BrokerStatistics {
        self.inner.state.lock().stats
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("InMemoryBroker")
            .field("queues", &state.queues.len())
            .field("exchanges", &state.exchanges.len())
            .field("connections", &state.connections.len())
            .field("refusing", &self.inner.refusing.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self) -> TransportResult<Arc<dyn TransportConnection>> {
        if self.inner.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(
                "broker is not accepting connections".to_string(),
            ));
        }

        let mut state = self.inner.state.lock();
        state.next_connection_id += 1;
        let (shutdown, _) = watch::channel(None);
        let shared = Arc::new(ConnectionShared {
            id: state.next_connection_id,
            shutdown,
            next_channel: AtomicU16::new(0),
        });
        state.connections.insert(shared.id, Arc::clone(&shared));
        state.stats.connections_opened += 1;
        debug!(connection = shared.id, "Connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            shared,
        }))
    }
}

impl BrokerInner {
    fn close_connection(&self, id: u64, reason: ShutdownReason) -> bool {
        let shared = {
            let mut state = self.state.lock();
            let Some(shared) = state.connections.remove(&id) else {
                return false;
            };
            let keys: Vec<ChannelKey> = state
                .channels
                .keys()
                .filter(|(connection, _)| *connection == id)
                .copied()
                .collect();
            for key in keys {
                state.close_channel(key);
            }
            shared
        };

        debug!(connection = id, reason = %reason, "Connection closed");
        shared.shutdown.send_replace(Some(reason));
        true
    }
}

impl BrokerState {
    fn sweep_expired_queues(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue.consumer.is_none()
                    && queue
                        .arguments
                        .expires
                        .is_some_and(|expires| now.duration_since(queue.last_used) >= expires)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            debug!(queue = %name, "Queue expired");
            self.remove_queue(&name);
        }
    }

    fn remove_queue(&mut self, name: &str) -> Option<u32> {
        let queue = self.queues.remove(name)?;
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|b| b.queue != name);
        }
        u32::try_from(queue.messages.len()).ok()
    }

    fn close_channel(&mut self, key: ChannelKey) -> bool {
        let Some(channel) = self.channels.remove(&key) else {
            return false;
        };

        let now = Instant::now();
        let mut touched = BTreeSet::new();
        for queue in self.queues.values_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.channel == key) {
                queue.consumer = None;
                queue.last_used = now;
            }
        }

        // Reverse order so the oldest unacked message ends up first
        for (_, (queue_name, mut message)) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.insert(queue_name);
            }
        }

        for queue_name in touched {
            self.dispatch(&queue_name);
        }
        true
    }

    fn route(&self, exchange: &str, routing_key: &str) -> BTreeSet<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect();
        }

        self.exchanges
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| topic_matches(&b.pattern, routing_key))
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push ready messages to the queue's consumer while its prefetch allows
    fn dispatch(&mut self, queue_name: &str) {
        let Self {
            queues,
            channels,
            stats,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        let now = Instant::now();

        loop {
            let Some(consumer) = queue.consumer.as_ref() else {
                return;
            };
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                return;
            };
            if let Some(prefetch) = channel.prefetch
                && channel.unacked.len() >= usize::from(prefetch)
            {
                return;
            }
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            if let Some(ttl) = queue.arguments.message_ttl
                && now.duration_since(message.enqueued_at) >= ttl
            {
                debug!(queue = %queue_name, "Discarding expired message");
                continue;
            }
            if consumer.no_local && message.publisher == consumer.channel.0 {
                continue;
            }

            channel.next_delivery_tag += 1;
            let tag = channel.next_delivery_tag;
            let delivery = InboundDelivery {
                delivery_tag: DeliveryTag(tag),
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                warn!(queue = %queue_name, "Consumer went away, cancelling it");
                queue.messages.push_front(message);
                queue.consumer = None;
                queue.last_used = now;
                return;
            }
            channel
                .unacked
                .insert(tag, (queue_name.to_string(), message));
            stats.messages_delivered += 1;
        }
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> TransportResult<Arc<dyn Channel>> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains_key(&self.shared.id) {
            return Err(TransportError::AlreadyClosed(format!(
                "connection {}",
                self.shared.id
            )));
        }

        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.channels.insert(
            (self.shared.id, id),
            ChannelState {
                prefetch: None,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
                confirm_mode: false,
                next_publish_seq: 1,
                events: events.clone(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            key: (self.shared.id, id),
            events,
        }))
    }

    async fn closed(&self) -> ShutdownReason {
        let mut shutdown = self.shared.shutdown.subscribe();
        match shutdown.wait_for(Option::is_some).await {
            Ok(reason) => reason
                .clone()
                .unwrap_or_else(|| ShutdownReason::forced("connection lost")),
            Err(_) => ShutdownReason::forced("connection lost"),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self
            .broker
            .close_connection(self.shared.id, ShutdownReason::application())
        {
            Ok(())
        } else {
            Err(TransportError::AlreadyClosed(format!(
                "connection {}",
                self.shared.id
            )))
        }
    }

    fn is_open(&self) -> bool {
        self.broker
            .state
            .lock()
            .connections
            .contains_key(&self.shared.id)
    }
}

struct MemoryChannel {
    broker: Arc<BrokerInner>,
    key: ChannelKey,
    events: broadcast::Sender<ChannelEvent>,
}

impl MemoryChannel {
    fn closed_error(&self) -> TransportError {
        TransportError::AlreadyClosed(format!("channel {} on connection {}", self.key.1, self.key.0))
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key.1
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().channels.contains_key(&self.key)
    }

    async fn queue_declare(&self, declare: QueueDeclare) -> TransportResult<QueueDeclareOk> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.key) {
            return Err(self.closed_error());
        }
        let now = Instant::now();
        state.sweep_expired_queues(now);
        state.stats.queue_declarations += 1;

        let name = match declare.name.filter(|name| !name.trim().is_empty()) {
            Some(name) => name,
            None => format!("{ANONYMOUS_QUEUE_PREFIX}{}", Uuid::new_v4().simple()),
        };

        let queue = state.queues.entry(name.clone()).or_insert_with(|| {
            debug!(queue = %name, "Queue declared");
            QueueState {
                messages: VecDeque::new(),
                consumer: None,
                arguments: declare.arguments,
                last_used: now,
            }
        });
        queue.last_used = now;

        Ok(QueueDeclareOk {
            queue: name,
            message_count: u32::try_from(queue.messages.len()).unwrap_or(u32::MAX),
            consumer_count: u32::from(queue.consumer.is_some()),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.key) {
            return Err(self.closed_error());
        }
        if exchange.is_empty() {
            return Err(TransportError::Protocol(
                "cannot bind to the default exchange".to_string(),
            ));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }

        state.stats.queue_binds += 1;
        let binding = ExchangeBinding {
            queue: queue.to_string(),
            pattern: routing_key.to_string(),
        };
        let bindings = state.exchanges.entry(exchange.to_string()).or_default();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> TransportResult<u32> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.key) {
            return Err(self.closed_error());
        }
        state
            .remove_queue(queue)
            .ok_or_else(|| TransportError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        let channel = state
            .channels
            .get_mut(&self.key)
            .ok_or_else(|| self.closed_error())?;
        channel.prefetch = (prefetch_count > 0).then_some(prefetch_count);
        Ok(())
    }

    async fn basic_publish(&self, publish: BasicPublish) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.key) {
            return Err(self.closed_error());
        }
        let now = Instant::now();
        state.sweep_expired_queues(now);
        state.stats.messages_published += 1;

        let behavior = state.confirm_behavior;
        let confirm_seq = match state.channels.get_mut(&self.key) {
            Some(channel) if channel.confirm_mode => {
                let seq = channel.next_publish_seq;
                channel.next_publish_seq += 1;
                Some(seq)
            }
            _ => None,
        };

        if confirm_seq.is_some() && behavior == ConfirmBehavior::Nack {
            if let Some(seq) = confirm_seq {
                let _ = self.events.send(ChannelEvent::Nack {
                    delivery_tag: seq,
                    multiple: false,
                });
            }
            return Ok(());
        }

        let targets = state.route(&publish.exchange, &publish.routing_key);
        if targets.is_empty() {
            if publish.mandatory {
                state.stats.messages_returned += 1;
                let _ = self.events.send(ChannelEvent::Return(BasicReturn {
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                    exchange: publish.exchange.clone(),
                    routing_key: publish.routing_key.clone(),
                    properties: publish.properties.clone(),
                    body: publish.body.clone(),
                }));
            }
        } else {
            state.stats.messages_routed += 1;
            for queue_name in &targets {
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.messages.push_back(StoredMessage {
                        exchange: publish.exchange.clone(),
                        routing_key: publish.routing_key.clone(),
                        properties: publish.properties.clone(),
                        body: publish.body.clone(),
                        redelivered: false,
                        publisher: self.key.0,
                        enqueued_at: now,
                    });
                }
                state.dispatch(queue_name);
            }
        }

        if let Some(seq) = confirm_seq
            && behavior == ConfirmBehavior::Ack
        {
            let _ = self.events.send(ChannelEvent::Ack {
                delivery_tag: seq,
                multiple: false,
            });
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        no_local: bool,
    ) -> TransportResult<mpsc::UnboundedReceiver<InboundDelivery>> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.key) {
            return Err(self.closed_error());
        }
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            })?;
        if entry
            .consumer
            .as_ref()
            .is_some_and(|c| !c.sender.is_closed())
        {
            return Err(TransportError::Protocol(format!(
                "queue '{queue}' already has a consumer"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        entry.consumer = Some(QueueConsumer {
            channel: self.key,
            no_local,
            sender,
        });
        state.dispatch(queue);
        Ok(receiver)
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        let channel = state
            .channels
            .get_mut(&self.key)
            .ok_or_else(|| self.closed_error())?;
        let (queue_name, _) = channel.unacked.remove(&delivery_tag.0).ok_or_else(|| {
            TransportError::Protocol(format!("unknown delivery tag {delivery_tag}"))
        })?;
        state.stats.messages_acked += 1;
        state.dispatch(&queue_name);
        Ok(())
    }

    async fn confirm_select(&self) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        let channel = state
            .channels
            .get_mut(&self.key)
            .ok_or_else(|| self.closed_error())?;
        channel.confirm_mode = true;
        Ok(())
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.broker
            .state
            .lock()
            .channels
            .get(&self.key)
            .filter(|channel| channel.confirm_mode)
            .map_or(0, |channel| channel.next_publish_seq)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> TransportResult<()> {
        if self.broker.state.lock().close_channel(self.key) {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }
}
