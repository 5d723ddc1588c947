//! Broker transport boundary
//!
//! The bus talks to a broker through three small traits: a [`Transport`] that
//! opens connections, a [`TransportConnection`] that opens channels and reports
//! shutdown, and a [`Channel`] exposing the exchange/queue/binding primitives.
//! [`memory::InMemoryBroker`] is a complete in-process implementation.

pub mod memory;

use crate::endpoint::{DeliveryTag, Endpoint, MessageId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Reply code for a mandatory message without a matching queue
pub const NO_ROUTE: u16 = 312;
/// Reply code for a normal close
pub const REPLY_SUCCESS: u16 = 200;
/// Reply code for a connection closed by the broker
pub const CONNECTION_FORCED: u16 = 320;

/// Header names written on outbound deliveries
pub mod headers {
    /// Identity of the publishing bus instance
    pub const PRODUCER_ID: &str = "x-daemoneye-producer-id";
    /// Per producer and message type sequence number
    pub const SEQUENCE: &str = "x-daemoneye-sequence";
}

/// Transport layer errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Errors after which the channel cannot be used any more
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::AlreadyClosed(_) | Self::Io(_))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Opens connections to a broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> TransportResult<Arc<dyn TransportConnection>>;
}

/// A live broker connection
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Open a channel on this connection
    async fn create_channel(&self) -> TransportResult<Arc<dyn Channel>>;

    /// Resolves once the connection has shut down, for whatever reason
    async fn closed(&self) -> ShutdownReason;

    /// Close the connection from the application side
    async fn close(&self) -> TransportResult<()>;

    /// Whether the connection is still open
    fn is_open(&self) -> bool;
}

/// A channel multiplexed over a connection
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel number, unique within its connection
    fn id(&self) -> u16;

    /// Whether the channel is still usable
    fn is_open(&self) -> bool;

    /// Declare (or re-declare) a queue
    async fn queue_declare(&self, declare: QueueDeclare) -> TransportResult<QueueDeclareOk>;

    /// Bind a queue to an exchange with a routing key pattern
    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
    -> TransportResult<()>;

    /// Delete a queue, returning the number of messages it held
    async fn queue_delete(&self, queue: &str) -> TransportResult<u32>;

    /// Limit unacknowledged deliveries on this channel
    async fn basic_qos(&self, prefetch_count: u16) -> TransportResult<()>;

    /// Publish a message
    async fn basic_publish(&self, publish: BasicPublish) -> TransportResult<()>;

    /// Start consuming a queue with manual acknowledgement
    async fn basic_consume(
        &self,
        queue: &str,
        no_local: bool,
    ) -> TransportResult<mpsc::UnboundedReceiver<InboundDelivery>>;

    /// Acknowledge one delivery
    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> TransportResult<()>;

    /// Put the channel into publisher confirm mode
    async fn confirm_select(&self) -> TransportResult<()>;

    /// Sequence number the next publish will be confirmed with
    fn next_publish_seq_no(&self) -> u64;

    /// Subscribe to returns and confirms raised on this channel
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Close the channel, requeueing its unacknowledged deliveries
    async fn close(&self) -> TransportResult<()>;
}

/// Message properties carried next to the body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicProperties {
    pub message_id: MessageId,
    pub correlation_id: MessageId,
    pub reply_to: Endpoint,
    pub type_name: String,
    pub content_type: String,
    pub persistent: bool,
    pub timestamp: Option<SystemTime>,
    pub headers: HashMap<String, String>,
}

impl BasicProperties {
    /// Header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// An outbound publish
#[derive(Debug, Clone)]
pub struct BasicPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// A mandatory message the broker could not route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicReturn {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// Asynchronous notifications raised on a channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Return(BasicReturn),
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
}

/// Who initiated a shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    Application,
    Peer,
    Library,
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReason {
    pub initiator: ShutdownInitiator,
    pub reply_code: u16,
    pub reply_text: String,
}

impl ShutdownReason {
    /// Close requested by this application
    pub fn application() -> Self {
        Self {
            initiator: ShutdownInitiator::Application,
            reply_code: REPLY_SUCCESS,
            reply_text: "Goodbye".to_string(),
        }
    }

    /// Close forced by the broker
    pub fn forced(text: impl Into<String>) -> Self {
        Self {
            initiator: ShutdownInitiator::Peer,
            reply_code: CONNECTION_FORCED,
            reply_text: text.into(),
        }
    }

    /// Whether the application asked for this shutdown
    pub fn is_graceful(&self) -> bool {
        self.initiator == ShutdownInitiator::Application
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} initiated shutdown ({}: {})",
            self.initiator, self.reply_code, self.reply_text
        )
    }
}

/// Optional queue arguments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-expires`: delete the queue after it has been unused this long
    pub expires: Option<Duration>,
    /// `x-message-ttl`: discard messages older than this
    pub message_ttl: Option<Duration>,
}

/// Queue declaration request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclare {
    /// Queue name, `None` for a server-named queue
    pub name: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

/// Result of a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
