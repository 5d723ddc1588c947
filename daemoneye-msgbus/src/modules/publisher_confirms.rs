//! Tracks outbound deliveries until the broker confirms them

use super::{DeliveryFailure, FailureCallback, PublishContext, PublishModule};
use crate::endpoint::MessageId;
use crate::error::Result;
use crate::transport::{Channel, ChannelEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Unconfirmed {
    message_id: MessageId,
    type_name: &'static str,
    sent_at: Instant,
    callback: Option<FailureCallback>,
}

/// (channel generation, confirm sequence number)
type ConfirmKey = (u64, u64);

#[derive(Default)]
struct ConfirmTable {
    entries: Mutex<BTreeMap<ConfirmKey, Unconfirmed>>,
}

impl ConfirmTable {
    fn confirm(&self, generation: u64, delivery_tag: u64, multiple: bool) -> Vec<Unconfirmed> {
        let mut entries = self.entries.lock();
        if multiple {
            let keys: Vec<ConfirmKey> = entries
                .range((generation, 0)..=(generation, delivery_tag))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        } else {
            entries
                .remove(&(generation, delivery_tag))
                .into_iter()
                .collect()
        }
    }

    fn expired(&self, now: Instant, timeout: Duration) -> Vec<Unconfirmed> {
        let mut entries = self.entries.lock();
        let keys: Vec<ConfirmKey> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= timeout)
            .map(|(key, _)| *key)
            .collect();
        keys.iter().filter_map(|key| entries.remove(key)).collect()
    }

    fn drain(&self) -> Vec<Unconfirmed> {
        std::mem::take(&mut *self.entries.lock())
            .into_values()
            .collect()
    }
}

fn report(entries: Vec<Unconfirmed>, failure: &DeliveryFailure) {
    for entry in entries {
        warn!(
            message_id = %entry.message_id,
            message_type = entry.type_name,
            failure = %failure,
            "Delivery not confirmed"
        );
        if let Some(callback) = entry.callback {
            callback.fire(failure.clone());
        }
    }
}

/// Puts each publishing channel in confirm mode and reports deliveries the
/// broker nacks, never confirms in time, or loses with the channel
///
/// Failed deliveries are not republished.
pub struct PublisherConfirmsModule {
    table: Arc<ConfirmTable>,
    timeout: Duration,
    check_interval: Duration,
    generation: AtomicU64,
    tasks: Mutex<Option<CancellationToken>>,
}

impl PublisherConfirmsModule {
    pub fn new(timeout: Duration, check_interval: Duration) -> Self {
        Self {
            table: Arc::new(ConfirmTable::default()),
            timeout,
            check_interval,
            generation: AtomicU64::new(0),
            tasks: Mutex::new(None),
        }
    }

    /// Deliveries still waiting for a confirm
    pub fn unconfirmed(&self) -> usize {
        self.table.entries.lock().len()
    }

    fn stop_tasks(&self) {
        if let Some(token) = self.tasks.lock().take() {
            token.cancel();
        }
    }

    fn spawn_listener(&self, channel: &Arc<dyn Channel>, generation: u64, token: CancellationToken) {
        let mut events = channel.subscribe_events();
        let table = Arc::clone(&self.table);
        let channel_id = channel.id();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ChannelEvent::Ack {
                        delivery_tag,
                        multiple,
                    }) => {
                        let confirmed = table.confirm(generation, delivery_tag, multiple);
                        debug!(delivery_tag, confirmed = confirmed.len(), "Publish confirmed");
                    }
                    Ok(ChannelEvent::Nack {
                        delivery_tag,
                        multiple,
                    }) => {
                        report(
                            table.confirm(generation, delivery_tag, multiple),
                            &DeliveryFailure::Nacked,
                        );
                    }
                    Ok(ChannelEvent::Return(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = channel_id, skipped, "Confirm listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_sweeper(&self, token: CancellationToken) {
        let table = Arc::clone(&self.table);
        let timeout = self.timeout;
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        report(table.expired(Instant::now(), timeout), &DeliveryFailure::Unconfirmed);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl PublishModule for PublisherConfirmsModule {
    fn initialize(&self) {
        info!(
            timeout_ms = self.timeout.as_millis(),
            "Publisher confirms enabled"
        );
    }

    async fn before_publish_enabled(&self, channel: &Arc<dyn Channel>) -> Result<()> {
        self.stop_tasks();
        channel.confirm_select().await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        *self.tasks.lock() = Some(token.clone());

        self.spawn_listener(channel, generation, token.clone());
        self.spawn_sweeper(token);
        Ok(())
    }

    fn before_publish(&self, context: &PublishContext<'_>) {
        if context.publish_seq_no == 0 {
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.table.entries.lock().insert(
            (generation, context.publish_seq_no),
            Unconfirmed {
                message_id: context.message_id,
                type_name: context.type_name,
                sent_at: Instant::now(),
                callback: context.on_failure.cloned(),
            },
        );
    }

    async fn after_publish_disabled(&self) {
        self.stop_tasks();
        report(self.table.drain(), &DeliveryFailure::ConnectionLost);
    }

    async fn dispose(&self) {
        self.stop_tasks();
        let remaining = self.table.drain();
        if !remaining.is_empty() {
            debug!(count = remaining.len(), "Discarding unconfirmed deliveries on disposal");
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::memory::{ConfirmBehavior, InMemoryBroker};
    use crate::transport::{BasicProperties, BasicPublish, Transport};

    fn failures() -> (FailureCallback, Arc<Mutex<Vec<DeliveryFailure>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let seen = Arc::clone(&seen);
            FailureCallback::new(move |failure| seen.lock().push(failure))
        };
        (callback, seen)
    }

    async fn publish_tracked(
        module: &PublisherConfirmsModule,
        channel: &Arc<dyn Channel>,
        callback: &FailureCallback,
    ) {
        let message_id = MessageId::new_random();
        module.before_publish(&PublishContext {
            message_id,
            type_name: "tests.tracked",
            mandatory: false,
            publish_seq_no: channel.next_publish_seq_no(),
            on_failure: Some(callback),
        });
        channel
            .basic_publish(BasicPublish {
                exchange: "ex".to_string(),
                routing_key: "key".to_string(),
                mandatory: false,
                properties: BasicProperties {
                    message_id,
                    ..BasicProperties::default()
                },
                body: Vec::new(),
            })
            .await
            .unwrap();
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_deliveries_are_released() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let module = PublisherConfirmsModule::new(Duration::from_secs(10), Duration::from_secs(1));
        module.before_publish_enabled(&channel).await.unwrap();

        let (callback, seen) = failures();
        publish_tracked(&module, &channel, &callback).await;
        settle().await;

        assert_eq!(module.unconfirmed(), 0);
        assert!(seen.lock().is_empty());
        module.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_nacks_are_reported() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_behavior(ConfirmBehavior::Nack);
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let module = PublisherConfirmsModule::new(Duration::from_secs(10), Duration::from_secs(1));
        module.before_publish_enabled(&channel).await.unwrap();

        let (callback, seen) = failures();
        publish_tracked(&module, &channel, &callback).await;
        settle().await;

        assert_eq!(*seen.lock(), vec![DeliveryFailure::Nacked]);
        module.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_withheld_confirms_time_out() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_behavior(ConfirmBehavior::Withhold);
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let module = PublisherConfirmsModule::new(Duration::from_secs(3), Duration::from_secs(1));
        module.before_publish_enabled(&channel).await.unwrap();

        let (callback, seen) = failures();
        publish_tracked(&module, &channel, &callback).await;
        assert_eq!(module.unconfirmed(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*seen.lock(), vec![DeliveryFailure::Unconfirmed]);
        assert_eq!(module.unconfirmed(), 0);
        module.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_confirms_fail_when_publishing_is_disabled() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_behavior(ConfirmBehavior::Withhold);
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let module = PublisherConfirmsModule::new(Duration::from_secs(30), Duration::from_secs(5));
        module.before_publish_enabled(&channel).await.unwrap();

        let (callback, seen) = failures();
        publish_tracked(&module, &channel, &callback).await;
        module.after_publish_disabled().await;

        assert_eq!(*seen.lock(), vec![DeliveryFailure::ConnectionLost]);
        assert_eq!(module.unconfirmed(), 0);
    }
}
