//! Message body serialization formats

use crate::error::{BusError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A body serialization format
///
/// Implementations are generic over the message type; the [`MessageRegistry`]
/// captures one serializer per registered type so the rest of the bus can
/// work with type-erased messages.
///
/// [`MessageRegistry`]: crate::message::MessageRegistry
pub trait MessageSerializer: Clone + Send + Sync + 'static {
    /// Content type tag written to outbound properties
    fn content_type(&self) -> &'static str;

    /// Serialize a message body
    fn serialize<T: Serialize>(&self, message: &T) -> Result<Vec<u8>>;

    /// Deserialize a message body
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON bodies via `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| BusError::serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| BusError::serialization(e.to_string()))
    }
}

/// Compact binary bodies via `bincode` with the standard configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl MessageSerializer for BincodeSerializer {
    fn content_type(&self) -> &'static str {
        "application/x-bincode"
    }

    fn serialize<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| BusError::serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BusError::serialization(e.to_string()))
            .map(|(result, _)| result)
    }
}
