//! Per-delivery message context
//!
//! Every inbound delivery becomes one [`CurrentMessageInformation`]. It is
//! handed to consumers explicitly inside a [`MessageContext`] and is also
//! installed in a task-local slot for the duration of the dispatch, so
//! [`MessageBus::reply`](crate::bus::MessageBus::reply) works from code that
//! only holds the bus.

use crate::endpoint::{DeliveryTag, Endpoint, MessageId};
use crate::error::{BusError, REPLY_OUT_OF_REQUEST_CONTEXT, Result};
use crate::message::{AnyMessage, BusMessage, MessageType};
use crate::modules::FailureCallback;
use crate::publishing::PublishingProcess;
use crate::transport::{Channel, TransportResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_MESSAGE: Arc<CurrentMessageInformation>;
}

/// Everything known about the message being handled
#[derive(Debug, Clone)]
pub struct CurrentMessageInformation {
    pub message_id: MessageId,
    pub message_type: MessageType,
    /// Reply endpoint of the sender
    pub endpoint: Endpoint,
    pub correlation_id: MessageId,
    pub delivery_tag: DeliveryTag,
    /// Exchange the message arrived on
    pub exchange: String,
    pub body: Arc<dyn AnyMessage>,
    pub headers: HashMap<String, String>,
    pub redelivered: bool,
    /// Present for transport deliveries, absent for local dispatch
    pub(crate) acknowledgement: Option<Acknowledgement>,
}

impl CurrentMessageInformation {
    /// Context for a message dispatched locally, without the transport
    pub fn local(message: Arc<dyn AnyMessage>) -> Self {
        Self {
            message_id: MessageId::EMPTY,
            message_type: message.runtime_type(),
            endpoint: Endpoint::empty(),
            correlation_id: MessageId::EMPTY,
            delivery_tag: DeliveryTag::LOCAL,
            exchange: String::new(),
            body: message,
            headers: HashMap::new(),
            redelivered: false,
            acknowledgement: None,
        }
    }

    /// The body as `T`, if it is one
    pub fn message<T: BusMessage>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    /// Whether a reply can be sent for this message
    pub fn is_request(&self) -> bool {
        !self.endpoint.is_empty() && !self.correlation_id.is_empty()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub(crate) fn ensure_request(&self) -> Result<()> {
        if self.is_request() {
            Ok(())
        } else {
            Err(BusError::invalid_operation(REPLY_OUT_OF_REQUEST_CONTEXT))
        }
    }
}

/// Acknowledges one delivery on the channel it arrived on
#[derive(Clone)]
pub(crate) struct Acknowledgement {
    channel: Arc<dyn Channel>,
    delivery_tag: DeliveryTag,
}

impl Acknowledgement {
    pub(crate) fn new(channel: Arc<dyn Channel>, delivery_tag: DeliveryTag) -> Self {
        Self {
            channel,
            delivery_tag,
        }
    }

    pub(crate) async fn ack(&self) -> TransportResult<()> {
        self.channel.basic_ack(self.delivery_tag).await
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("channel", &self.channel.id())
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

/// The message being handled by the current task, if any
pub fn current_message() -> Option<Arc<CurrentMessageInformation>> {
    CURRENT_MESSAGE.try_with(Arc::clone).ok()
}

/// Run `future` with `information` as the current message
pub(crate) async fn with_current_message<F>(
    information: Arc<CurrentMessageInformation>,
    future: F,
) -> F::Output
where
    F: Future,
{
    CURRENT_MESSAGE.scope(information, future).await
}

/// What a consumer receives for each message
#[derive(Clone)]
pub struct MessageContext {
    current: Arc<CurrentMessageInformation>,
    publisher: Arc<PublishingProcess>,
}

impl MessageContext {
    pub(crate) fn new(
        current: Arc<CurrentMessageInformation>,
        publisher: Arc<PublishingProcess>,
    ) -> Self {
        Self { current, publisher }
    }

    pub fn current(&self) -> &CurrentMessageInformation {
        &self.current
    }

    pub fn message<T: BusMessage>(&self) -> Option<&T> {
        self.current.message::<T>()
    }

    pub fn message_type(&self) -> MessageType {
        self.current.message_type
    }

    /// Reply to the sender of the current request
    pub fn reply<T: BusMessage>(&self, message: &T) -> Result<()> {
        self.reply_with(message, None, true)
    }

    /// Reply with a failure callback and persistence flag
    pub fn reply_with<T: BusMessage>(
        &self,
        message: &T,
        on_failure: Option<FailureCallback>,
        persistent: bool,
    ) -> Result<()> {
        self.publisher
            .reply(message, &self.current, on_failure, persistent)
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.current.message_id)
            .field("message_type", &self.current.message_type)
            .finish()
    }
}
