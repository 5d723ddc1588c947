//! Addressing and identity value types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// An addressable endpoint (queue name) which can receive messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    /// The unset endpoint
    pub const fn empty() -> Self {
        Self(String::new())
    }

    /// Create an endpoint for a queue name
    pub fn new(queue: impl Into<String>) -> Self {
        Self(queue.into())
    }

    /// Queue name of this endpoint
    pub fn queue(&self) -> &str {
        &self.0
    }

    /// Whether the endpoint is unset (empty or whitespace)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(queue: &str) -> Self {
        Self::new(queue)
    }
}

impl From<String> for Endpoint {
    fn from(queue: String) -> Self {
        Self(queue)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl AsRef<str> for Endpoint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque message/correlation identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// The empty sentinel
    pub const EMPTY: Self = Self(Uuid::nil());

    /// Generate a new random identifier
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Whether this is the empty sentinel
    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    /// The underlying uuid
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::EMPTY);
        }
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of a publishing bus instance, carried in a header for deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId(Uuid);

impl ProducerId {
    /// Generate a new producer identity
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProducerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Transport-assigned handle identifying one inbound delivery for acknowledgement
///
/// Tag zero is never assigned by a broker and marks locally dispatched messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl DeliveryTag {
    /// Tag used for messages that did not arrive through the transport
    pub const LOCAL: Self = Self(0);

    /// Whether the delivery came from the transport and needs acknowledging
    pub fn is_local(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
