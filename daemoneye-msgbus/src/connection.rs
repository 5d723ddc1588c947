//! Reliable broker connection with constant-interval reconnection
//!
//! A single background task owns the connect loop. Every successful connection
//! is announced to the registered [`ConnectionObserver`]s in registration order
//! and each one is awaited before the next, so later observers can rely on the
//! work of earlier ones (the consuming process declares its queue before the
//! publishing process opens its gate).

use crate::error::{BusError, Result};
use crate::transport::{
    Channel, ShutdownInitiator, ShutdownReason, Transport, TransportConnection, TransportError,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Lifecycle notifications broadcast to interested listeners
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established,
    AttemptFailed(TransportError),
    UnexpectedShutdown(ShutdownReason),
    GracefulShutdown(ShutdownReason),
}

/// Ordered, awaited participant in connection lifecycle transitions
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// A connection was (re)established; an error closes it and schedules a retry
    async fn connection_established(&self, connection: &Arc<dyn TransportConnection>)
    -> Result<()>;

    async fn connection_attempt_failed(&self, _error: &TransportError) {}

    async fn unexpected_shutdown(&self, _reason: &ShutdownReason) {}

    async fn graceful_shutdown(&self, _reason: &ShutdownReason) {}
}

/// Owns the single logical connection to the broker
pub struct ReliableConnection {
    transport: Arc<dyn Transport>,
    attempt_interval: Duration,
    state: watch::Sender<ConnectionState>,
    current: RwLock<Option<Arc<dyn TransportConnection>>>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    first_connect: Mutex<Option<oneshot::Receiver<()>>>,
    started: AtomicBool,
    disposed: AtomicBool,
    attempts: AtomicU64,
}

impl ReliableConnection {
    /// Create a connection manager retrying every `attempt_interval`
    pub fn new(transport: Arc<dyn Transport>, attempt_interval: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            transport,
            attempt_interval,
            state,
            current: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            events,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            first_connect: Mutex::new(None),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        }
    }

    /// Register an observer; notifications follow registration order
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    /// Delay between connection attempts
    pub fn connection_attempt_interval(&self) -> Duration {
        self.attempt_interval
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Total connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.current.read().as_ref().is_some_and(|c| c.is_open())
    }

    /// Open a channel on the live connection
    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let connection = self.current.read().clone().ok_or(BusError::NotConnected)?;
        Ok(connection.create_channel().await?)
    }

    /// Start the connect loop and wait for the first successful connection
    ///
    /// Attempts are retried forever; this only returns an error when the
    /// connection is disposed of before it ever connects.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::disposed("reliable connection"));
        }

        if !self.started.swap(true, Ordering::SeqCst) {
            let (ready_tx, ready_rx) = oneshot::channel();
            *self.first_connect.lock() = Some(ready_rx);
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move { this.run(ready_tx).await });
            *self.task.lock() = Some(handle);
        }

        let ready = self.first_connect.lock().take();
        match ready {
            Some(ready) => {
                tokio::select! {
                    result = ready => result.map_err(|_| BusError::disposed("reliable connection")),
                    () = self.cancel.cancelled() => Err(BusError::disposed("reliable connection")),
                }
            }
            None => {
                // Someone else is waiting on the first connection; follow the state
                let mut state = self.state.subscribe();
                tokio::select! {
                    result = state.wait_for(|s| *s == ConnectionState::Connected) => {
                        result.map(|_| ()).map_err(|_| BusError::disposed("reliable connection"))
                    }
                    () = self.cancel.cancelled() => Err(BusError::disposed("reliable connection")),
                }
            }
        }
    }

    async fn run(self: Arc<Self>, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(attempt, "Connecting to broker");

            let result = tokio::select! {
                result = self.transport.connect() => result,
                () = self.cancel.cancelled() => break,
            };

            match result {
                Err(e) => {
                    warn!(attempt, error = %e, "Connection attempt failed");
                    self.state.send_replace(ConnectionState::Disconnected);
                    for observer in self.observers_snapshot() {
                        observer.connection_attempt_failed(&e).await;
                    }
                    let _ = self.events.send(ConnectionEvent::AttemptFailed(e));
                }
                Ok(connection) => {
                    // Stays Connecting until every observer has finished its setup
                    *self.current.write() = Some(Arc::clone(&connection));

                    if let Err(e) = self.notify_established(&connection).await {
                        error!(error = %e, "Connection setup failed, closing connection");
                        *self.current.write() = None;
                        if let Err(close_error) = connection.close().await {
                            debug!(error = %close_error, "Close after failed setup");
                        }
                        let reason = ShutdownReason {
                            initiator: ShutdownInitiator::Library,
                            reply_code: 0,
                            reply_text: e.to_string(),
                        };
                        self.raise_unexpected(reason).await;
                    } else {
                        self.state.send_replace(ConnectionState::Connected);
                        info!(attempt, "Connection established");
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                        let _ = self.events.send(ConnectionEvent::Established);

                        let reason = tokio::select! {
                            biased;
                            reason = connection.closed() => reason,
                            () = self.cancel.cancelled() => {
                                if let Err(e) = connection.close().await {
                                    debug!(error = %e, "Close during disposal");
                                }
                                ShutdownReason::application()
                            }
                        };
                        *self.current.write() = None;

                        if reason.is_graceful() {
                            self.state.send_replace(ConnectionState::Disconnected);
                            info!(reason = %reason, "Connection closed");
                            for observer in self.observers_snapshot() {
                                observer.graceful_shutdown(&reason).await;
                            }
                            let _ = self.events.send(ConnectionEvent::GracefulShutdown(reason));
                            break;
                        }

                        self.raise_unexpected(reason).await;
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.attempt_interval) => {}
                () = self.cancel.cancelled() => break,
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        debug!("Connect loop finished");
    }

    async fn notify_established(&self, connection: &Arc<dyn TransportConnection>) -> Result<()> {
        for observer in self.observers_snapshot() {
            observer.connection_established(connection).await?;
        }
        Ok(())
    }

    async fn raise_unexpected(&self, reason: ShutdownReason) {
        warn!(reason = %reason, "Unexpected connection shutdown");
        self.state.send_replace(ConnectionState::Connecting);
        for observer in self.observers_snapshot() {
            observer.unexpected_shutdown(&reason).await;
        }
        let _ = self.events.send(ConnectionEvent::UnexpectedShutdown(reason));
    }

    fn observers_snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers.read().clone()
    }

    /// Close the live connection gracefully and stop retrying
    ///
    /// Calling this more than once has no further effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ConnectionState::ShuttingDown);

        let connection = self.current.read().clone();
        if let Some(connection) = connection
            && let Err(e) = connection.close().await
        {
            debug!(error = %e, "Connection already closed during disposal");
        }

        // The loop polls the close notification ahead of cancellation
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Connect loop join error");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl std::fmt::Debug for ReliableConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableConnection")
            .field("state", &self.state())
            .field("attempt_interval", &self.attempt_interval)
            .field("attempts", &self.attempts())
            .finish()
    }
}
