//! Receive queue declaration

use crate::config::BusOptions;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::transport::{Channel, QueueArguments, QueueDeclare};
use tracing::debug;

/// Declares the bus receive queue with the configured expiry arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFactory {
    arguments: QueueArguments,
}

impl QueueFactory {
    pub fn new(options: &BusOptions) -> Self {
        Self {
            arguments: QueueArguments {
                expires: options.queue_unused_timeout(),
                message_ttl: options.message_ttl_on_queue(),
            },
        }
    }

    pub fn arguments(&self) -> QueueArguments {
        self.arguments
    }

    /// Declare the queue, re-using `previous` when a name was already assigned
    ///
    /// The queue is server-named the first time. Later declarations use the
    /// same name so a queue that expired while disconnected comes back under
    /// the address peers already know.
    pub async fn create(&self, channel: &dyn Channel, previous: &Endpoint) -> Result<Endpoint> {
        let name = (!previous.is_empty()).then(|| previous.queue().to_string());
        let declared = channel
            .queue_declare(QueueDeclare {
                name,
                durable: false,
                exclusive: false,
                auto_delete: false,
                arguments: self.arguments,
            })
            .await?;

        debug!(
            queue = %declared.queue,
            messages = declared.message_count,
            "Receive queue declared"
        );
        Ok(Endpoint::new(declared.queue))
    }
}
