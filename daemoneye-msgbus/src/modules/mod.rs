//! Hooks wrapping every outbound delivery
//!
//! Modules see each channel before publishing is enabled on it, each publish
//! just before it reaches the channel, and the channel again once publishing is
//! disabled. Delivery problems found by a module are reported through the
//! caller's [`FailureCallback`].

pub mod basic_return;
pub mod publisher_confirms;

pub use basic_return::BasicReturnModule;
pub use publisher_confirms::PublisherConfirmsModule;

use crate::endpoint::MessageId;
use crate::error::Result;
use crate::transport::{BasicReturn, Channel};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Why an outbound delivery is considered failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The broker returned a mandatory message it could not route
    Returned(BasicReturn),
    /// The broker refused the message
    Nacked,
    /// No confirm arrived within the confirm timeout
    Unconfirmed,
    /// The channel went away before the message was confirmed
    ConnectionLost,
    /// Publishing raised a channel error and the message was dropped
    ChannelError(String),
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned(r) => write!(f, "returned ({} {})", r.reply_code, r.reply_text),
            Self::Nacked => f.write_str("nacked by broker"),
            Self::Unconfirmed => f.write_str("not confirmed in time"),
            Self::ConnectionLost => f.write_str("connection lost before confirm"),
            Self::ChannelError(e) => write!(f, "channel error: {e}"),
        }
    }
}

struct CallbackInner {
    fired: AtomicBool,
    callback: Box<dyn Fn(DeliveryFailure) + Send + Sync>,
}

/// Caller-supplied failure notification, invoked at most once
///
/// Clones share the fired flag, so every module holding a clone can report
/// without risking a second invocation.
#[derive(Clone)]
pub struct FailureCallback {
    inner: Arc<CallbackInner>,
}

impl FailureCallback {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(DeliveryFailure) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(CallbackInner {
                fired: AtomicBool::new(false),
                callback: Box::new(callback),
            }),
        }
    }

    /// Invoke the callback unless it already ran; returns whether it ran now
    pub fn fire(&self, failure: DeliveryFailure) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            debug!(failure = %failure, "Failure callback already invoked");
            return false;
        }
        (self.inner.callback)(failure);
        true
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for FailureCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureCallback")
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// What a module learns about a publish before it happens
#[derive(Debug)]
pub struct PublishContext<'a> {
    pub message_id: MessageId,
    pub type_name: &'static str,
    pub mandatory: bool,
    /// Confirm sequence number the channel will assign, zero outside confirm mode
    pub publish_seq_no: u64,
    pub on_failure: Option<&'a FailureCallback>,
}

/// A hook around outbound deliveries
#[async_trait]
pub trait PublishModule: Send + Sync {
    /// Called once when the publishing process starts
    fn initialize(&self) {}

    /// A new channel is about to carry publishes
    async fn before_publish_enabled(&self, _channel: &Arc<dyn Channel>) -> Result<()> {
        Ok(())
    }

    /// A delivery is about to be handed to the channel
    fn before_publish(&self, _context: &PublishContext<'_>) {}

    /// Publishing was disabled after the channel was lost
    async fn after_publish_disabled(&self) {}

    async fn dispose(&self) {}
}

/// Ordered chain of publish modules, itself a module
#[derive(Default, Clone)]
pub struct PublishModuleCollection {
    modules: Vec<Arc<dyn PublishModule>>,
}

impl PublishModuleCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a module ahead of every other one
    pub fn add_first(&mut self, module: Arc<dyn PublishModule>) {
        self.modules.insert(0, module);
    }

    pub fn add_last(&mut self, module: Arc<dyn PublishModule>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[async_trait]
impl PublishModule for PublishModuleCollection {
    fn initialize(&self) {
        for module in &self.modules {
            module.initialize();
        }
    }

    async fn before_publish_enabled(&self, channel: &Arc<dyn Channel>) -> Result<()> {
        for module in &self.modules {
            module.before_publish_enabled(channel).await?;
        }
        Ok(())
    }

    fn before_publish(&self, context: &PublishContext<'_>) {
        for module in &self.modules {
            module.before_publish(context);
        }
    }

    async fn after_publish_disabled(&self) {
        for module in &self.modules {
            module.after_publish_disabled().await;
        }
    }

    async fn dispose(&self) {
        for module in &self.modules {
            module.dispose().await;
        }
    }
}

impl fmt::Debug for PublishModuleCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishModuleCollection")
            .field("modules", &self.modules.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_failure_callback_fires_once_across_clones() {
        let count = Arc::new(AtomicUsize::new(0));
        let callback = {
            let count = Arc::clone(&count);
            FailureCallback::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let clone = callback.clone();

        assert!(callback.fire(DeliveryFailure::Nacked));
        assert!(!clone.fire(DeliveryFailure::Unconfirmed));
        assert!(clone.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    struct Named {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl PublishModule for Named {
        fn before_publish(&self, _context: &PublishContext<'_>) {
            self.log.lock().push(self.name);
        }
    }

    #[test]
    fn test_collection_runs_modules_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = PublishModuleCollection::new();
        modules.add_last(Arc::new(Named {
            name: "second",
            log: Arc::clone(&log),
        }));
        modules.add_first(Arc::new(Named {
            name: "first",
            log: Arc::clone(&log),
        }));
        modules.add_last(Arc::new(Named {
            name: "third",
            log: Arc::clone(&log),
        }));

        modules.before_publish(&PublishContext {
            message_id: MessageId::new_random(),
            type_name: "tests.any",
            mandatory: false,
            publish_seq_no: 0,
            on_failure: None,
        });
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(modules.len(), 3);
    }
}
