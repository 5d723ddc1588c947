//! Correlates broker returns with the failure callback of the mandatory publish

use super::{DeliveryFailure, FailureCallback, PublishContext, PublishModule};
use crate::endpoint::MessageId;
use crate::error::Result;
use crate::transport::{Channel, ChannelEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Registration {
    callback: FailureCallback,
    registered_at: Instant,
}

/// Invokes the registered failure callback when a mandatory message comes back
///
/// Each registration is keyed by message id and released on its first return.
/// Registrations never returned are pruned after the retention window.
pub struct BasicReturnModule {
    registrations: Arc<Mutex<HashMap<MessageId, Registration>>>,
    retention: Duration,
    listener: Mutex<Option<CancellationToken>>,
}

impl BasicReturnModule {
    pub fn new(retention: Duration) -> Self {
        Self {
            registrations: Arc::new(Mutex::new(HashMap::new())),
            retention,
            listener: Mutex::new(None),
        }
    }

    /// Number of callbacks still waiting for a possible return
    pub fn pending(&self) -> usize {
        self.registrations.lock().len()
    }

    fn prune(&self, now: Instant) {
        let retention = self.retention;
        self.registrations
            .lock()
            .retain(|_, registration| now.duration_since(registration.registered_at) < retention);
    }

    fn stop_listener(&self) {
        if let Some(token) = self.listener.lock().take() {
            token.cancel();
        }
    }
}

#[async_trait]
impl PublishModule for BasicReturnModule {
    async fn before_publish_enabled(&self, channel: &Arc<dyn Channel>) -> Result<()> {
        self.stop_listener();

        let token = CancellationToken::new();
        *self.listener.lock() = Some(token.clone());

        // The listener owns its own event receiver for this channel
        let mut events = channel.subscribe_events();
        let registrations = Arc::clone(&self.registrations);
        let channel_id = channel.id();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ChannelEvent::Return(basic_return)) => {
                        let message_id = basic_return.properties.message_id;
                        let registration = registrations.lock().remove(&message_id);
                        match registration {
                            Some(registration) => {
                                debug!(
                                    message_id = %message_id,
                                    reply_code = basic_return.reply_code,
                                    "Mandatory message returned"
                                );
                                registration
                                    .callback
                                    .fire(DeliveryFailure::Returned(basic_return));
                            }
                            None => {
                                debug!(message_id = %message_id, "Return without a registered callback");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = channel_id, skipped, "Return listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(channel = channel_id, "Return listener stopped");
        });
        Ok(())
    }

    fn before_publish(&self, context: &PublishContext<'_>) {
        let now = Instant::now();
        self.prune(now);

        if !context.mandatory {
            return;
        }
        if let Some(callback) = context.on_failure {
            self.registrations.lock().insert(
                context.message_id,
                Registration {
                    callback: callback.clone(),
                    registered_at: now,
                },
            );
        }
    }

    async fn after_publish_disabled(&self) {
        self.stop_listener();
    }

    async fn dispose(&self) {
        self.stop_listener();
        self.registrations.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::memory::InMemoryBroker;
    use crate::transport::{BasicProperties, BasicPublish, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(count: &Arc<AtomicUsize>) -> FailureCallback {
        let count = Arc::clone(count);
        FailureCallback::new(move |failure| {
            assert!(matches!(failure, DeliveryFailure::Returned(_)));
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn unroutable(message_id: MessageId) -> BasicPublish {
        BasicPublish {
            exchange: "nowhere".to_string(),
            routing_key: "nobody".to_string(),
            mandatory: true,
            properties: BasicProperties {
                message_id,
                ..BasicProperties::default()
            },
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_return_fires_only_the_matching_callback() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let module = BasicReturnModule::new(Duration::from_secs(60));
        module.before_publish_enabled(&channel).await.unwrap();

        let returned = Arc::new(AtomicUsize::new(0));
        let unrelated = Arc::new(AtomicUsize::new(0));
        let returned_id = MessageId::new_random();
        let unrelated_callback = counting_callback(&unrelated);
        let returned_callback = counting_callback(&returned);

        module.before_publish(&PublishContext {
            message_id: MessageId::new_random(),
            type_name: "tests.other",
            mandatory: true,
            publish_seq_no: 0,
            on_failure: Some(&unrelated_callback),
        });
        module.before_publish(&PublishContext {
            message_id: returned_id,
            type_name: "tests.lost",
            mandatory: true,
            publish_seq_no: 0,
            on_failure: Some(&returned_callback),
        });
        assert_eq!(module.pending(), 2);

        channel.basic_publish(unroutable(returned_id)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while returned.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(returned.load(Ordering::SeqCst), 1);
        assert_eq!(unrelated.load(Ordering::SeqCst), 0);
        assert_eq!(module.pending(), 1);
        module.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_registrations_are_pruned_after_retention() {
        let module = BasicReturnModule::new(Duration::from_secs(10));
        let count = Arc::new(AtomicUsize::new(0));
        let callback = counting_callback(&count);

        module.before_publish(&PublishContext {
            message_id: MessageId::new_random(),
            type_name: "tests.slow",
            mandatory: true,
            publish_seq_no: 0,
            on_failure: Some(&callback),
        });
        module.before_publish(&PublishContext {
            message_id: MessageId::new_random(),
            type_name: "tests.fire_and_forget",
            mandatory: false,
            publish_seq_no: 0,
            on_failure: Some(&callback),
        });
        assert_eq!(module.pending(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        module.before_publish(&PublishContext {
            message_id: MessageId::new_random(),
            type_name: "tests.no_callback",
            mandatory: true,
            publish_seq_no: 0,
            on_failure: None,
        });
        assert_eq!(module.pending(), 0);
    }
}
