//! Message id and per-producer sequence generation

use crate::endpoint::MessageId;
use crate::message::MessageType;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Produces message and correlation identifiers
pub trait IdGenerator: Send + Sync {
    /// Next identifier, never [`MessageId::EMPTY`]
    fn next(&self) -> MessageId;
}

/// Random (v4 uuid) identifiers
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next(&self) -> MessageId {
        MessageId::new_random()
    }
}

/// Produces monotonic sequence numbers for outbound messages
///
/// Sequences are per message type: consumers bind per type, so a single
/// counter shared by every type would show gaps to any consumer that does
/// not receive all of them.
pub trait SequenceGenerator: Send + Sync {
    /// Next sequence number for `message_type`, starting at 1
    fn next(&self, message_type: &MessageType) -> u64;
}

/// Thread-safe incrementing counter per message type
#[derive(Debug, Default)]
pub struct IncrementalSequenceGenerator {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl IncrementalSequenceGenerator {
    /// Create a generator with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceGenerator for IncrementalSequenceGenerator {
    fn next(&self, message_type: &MessageType) -> u64 {
        let mut counters = self.counters.lock();
        let counter = counters.entry(message_type.name()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }
}
