//! Error types for the DaemonEye message bus

use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for message bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur in message bus operations
///
/// Connection-level failures never surface here during normal operation: they
/// are retried by the reliable connection and reported as lifecycle events.
/// Callers of the fire-and-forget publish operations only see protocol misuse
/// synchronously; delivery failures arrive through failure callbacks.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BusError {
    /// Transport layer errors (connection, channel, broker)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A message type was used that the registry does not know about
    #[error("Unregistered message type: {0}")]
    UnregisteredMessageType(String),

    /// Configuration errors (missing exchange, invalid options)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation is not valid in the current context
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The reliable connection has no live connection
    #[error("Not connected to the broker")]
    NotConnected,

    /// The component has been disposed of
    #[error("Disposed: {0}")]
    Disposed(String),
}

impl BusError {
    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an unregistered message type error
    pub fn unregistered(type_name: impl Into<String>) -> Self {
        Self::UnregisteredMessageType(type_name.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a disposed error
    pub fn disposed(component: impl Into<String>) -> Self {
        Self::Disposed(component.into())
    }

    /// Whether this error is the invalid-operation condition raised on protocol misuse
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }
}

/// Message used when `reply` is invoked outside of a message handling context
pub(crate) const REPLY_OUT_OF_REQUEST_CONTEXT: &str =
    "reply invoked outside of a request context: the current message has no reply endpoint or correlation id";
