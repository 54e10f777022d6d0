//! Postgres change capture.
//!
//! [`ChangeCaptureListener`] installs a generic row-change trigger on every
//! watched table, holds one `LISTEN` connection on a shared channel, and fans
//! each notification out to the listeners registered for its table.
//!
//! Lifecycle: `Stopped -> Initializing -> Listening -> Stopped`.
//!
//! - [`initialize`](ChangeCaptureListener::initialize) installs the DDL and
//!   subscribes the channel. DDL failure is fatal and returned as-is.
//! - [`start`](ChangeCaptureListener::start) spawns the receive loop and
//!   returns immediately.
//! - Each (notification, listener) pair runs in its own task under its own
//!   timeout. A bounded semaphore caps the number of in-flight dispatches;
//!   when it is saturated the receive loop waits.
//! - A lost connection or failed liveness probe ends the loop with an error
//!   that [`join`](ChangeCaptureListener::join) hands back to the owner.

pub mod ddl;
pub mod event;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, Error};

pub use ddl::{DEFAULT_CHANNEL, PgTriggerInstaller, TriggerInstaller, validate_identifier};
pub use event::{Change, Operation, TableChangeEvent};
pub use source::{NotificationSource, PgNotificationSource};

// ── Listener trait ───────────────────────────────────────────────────

/// Receives change events for one table.
#[async_trait]
pub trait TableListener: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &str;

    async fn on_change(&self, event: &TableChangeEvent) -> Result<(), BoxError>;
}

// ── Configuration / state ────────────────────────────────────────────

/// Tuning knobs for the receive loop.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Notification channel shared by all watched tables.
    pub channel: String,
    /// Per-listener bound on handling one event. Default: 30s.
    pub dispatch_timeout: Duration,
    /// Silence after which the connection is probed. Default: 90s.
    pub idle_probe: Duration,
    /// Maximum concurrently running listener dispatches. Default: 64.
    pub max_in_flight: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_owned(),
            dispatch_timeout: Duration::from_secs(30),
            idle_probe: Duration::from_secs(90),
            max_in_flight: 64,
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Initializing,
    Listening,
}

// ── ChangeCaptureListener ────────────────────────────────────────────

/// Cheaply cloneable handle; all clones share one loop.
#[derive(Clone)]
pub struct ChangeCaptureListener {
    inner: Arc<Inner>,
}

struct Inner {
    config: CaptureConfig,
    installer: Arc<dyn TriggerInstaller>,
    /// Taken by the receive loop on `start()`.
    source: Mutex<Option<Box<dyn NotificationSource>>>,
    listeners: DashMap<String, Vec<Arc<dyn TableListener>>>,
    /// Channels already `LISTEN`ed on the source.
    listened: DashSet<String>,
    state: watch::Sender<CaptureState>,
    permits: Arc<Semaphore>,
    /// Held for reading while dispatches are spawned; `stop()` takes the
    /// write side so nothing new starts once it returns.
    gate: RwLock<()>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), Error>>>>,
}

impl ChangeCaptureListener {
    pub fn new(
        config: CaptureConfig,
        installer: Arc<dyn TriggerInstaller>,
        source: Box<dyn NotificationSource>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::Stopped);
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));

        Self {
            inner: Arc::new(Inner {
                config,
                installer,
                source: Mutex::new(Some(source)),
                listeners: DashMap::new(),
                listened: DashSet::new(),
                state,
                permits,
                gate: RwLock::new(()),
                cancel,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    pub fn state(&self) -> CaptureState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CaptureState> {
        self.inner.state.subscribe()
    }

    /// Tables with at least one listener, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .inner
            .listeners
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        tables.sort();
        tables
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Add `listener` for `table`.
    ///
    /// Registering the first listener for a table while already listening
    /// installs that table's trigger immediately.
    pub async fn register_listener(
        &self,
        table: &str,
        listener: Arc<dyn TableListener>,
    ) -> Result<(), Error> {
        validate_identifier(table)?;

        let first_for_table = {
            let mut entry = self.inner.listeners.entry(table.to_owned()).or_default();
            entry.push(Arc::clone(&listener));
            entry.len() == 1
        };
        debug!(table, listener = listener.name(), "registered table listener");

        if first_for_table && self.state() == CaptureState::Listening {
            self.inner.installer.install_trigger(table).await?;
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Install the trigger function and per-table triggers, then `LISTEN`.
    ///
    /// Any failure leaves the listener `Stopped` and is returned unchanged;
    /// nothing is retried.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.inner.state.send_replace(CaptureState::Initializing);

        let result = self.install_and_listen().await;
        if let Err(ref e) = result {
            error!(error = %e, "change capture initialization failed");
            self.inner.state.send_replace(CaptureState::Stopped);
        }
        result
    }

    async fn install_and_listen(&self) -> Result<(), Error> {
        let channel = &self.inner.config.channel;
        self.inner.installer.install_function(channel).await?;
        for table in self.tables() {
            self.inner.installer.install_trigger(&table).await?;
        }

        if self.inner.listened.insert(channel.clone()) {
            let mut guard = self.inner.source.lock().await;
            let Some(source) = guard.as_mut() else {
                self.inner.listened.remove(channel);
                return Err(Error::AlreadyStarted);
            };
            if let Err(e) = source.listen(channel).await {
                self.inner.listened.remove(channel);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Spawn the receive loop. Returns without waiting for notifications.
    pub async fn start(&self) -> Result<(), Error> {
        if self.state() == CaptureState::Stopped {
            self.initialize().await?;
        }

        let source = self
            .inner
            .source
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyStarted)?;

        self.inner.state.send_replace(CaptureState::Listening);
        info!(
            channel = %self.inner.config.channel,
            tables = ?self.tables(),
            "change capture listening"
        );

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = receive_loop(Arc::clone(&inner), source).await;
            inner.state.send_replace(CaptureState::Stopped);
            result
        });
        *self.inner.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the receive loop. Idempotent. Once this returns no further
    /// notifications are dispatched; dispatches already running may finish.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let _barrier = self.inner.gate.write().await;
        self.inner.state.send_replace(CaptureState::Stopped);
        debug!("change capture stopped");
    }

    /// Wait for the receive loop to end and surface its outcome.
    ///
    /// Returns `Ok(())` after a clean stop, or the fatal error that ended the
    /// loop. Returns immediately if the loop was never started or already
    /// joined.
    pub async fn join(&self) -> Result<(), Error> {
        let handle = self.inner.task.lock().await.take();
        match handle {
            Some(handle) => handle.await.map_err(|e| Error::Task(e.to_string()))?,
            None => Ok(()),
        }
    }
}

// ── Receive loop ─────────────────────────────────────────────────────

async fn receive_loop(
    inner: Arc<Inner>,
    mut source: Box<dyn NotificationSource>,
) -> Result<(), Error> {
    let idle = inner.config.idle_probe;

    loop {
        let next = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            next = tokio::time::timeout(idle, source.recv()) => next,
        };

        match next {
            Ok(Ok(payload)) => inner.dispatch(&payload).await,
            Ok(Err(e)) => {
                error!(error = %e, "change capture connection lost");
                return Err(e);
            }
            Err(_) => {
                debug!(idle_secs = idle.as_secs(), "no notifications, probing connection");
                if let Err(e) = source.ping().await {
                    error!(error = %e, "change capture liveness probe failed");
                    return Err(e);
                }
            }
        }
    }

    debug!("change capture loop exiting");
    Ok(())
}

impl Inner {
    async fn dispatch(&self, payload: &str) {
        let event = match TableChangeEvent::parse(payload) {
            Ok(event) => Arc::new(event),
            Err(e) => {
                warn!(error = %e, "dropping unparseable change notification");
                return;
            }
        };

        let listeners = self
            .listeners
            .get(&event.table)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        if listeners.is_empty() {
            debug!(table = %event.table, "no listeners for table");
            return;
        }

        let _gate = self.gate.read().await;
        if self.cancel.is_cancelled() {
            return;
        }

        debug!(
            table = %event.table,
            operation = %event.operation,
            listeners = listeners.len(),
            "dispatching change"
        );

        for listener in listeners {
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let event = Arc::clone(&event);
            let timeout = self.config.dispatch_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(timeout, listener.on_change(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        table = %event.table,
                        listener = listener.name(),
                        error = %e,
                        "table listener failed"
                    ),
                    Err(_) => warn!(
                        table = %event.table,
                        listener = listener.name(),
                        timeout_secs = timeout.as_secs(),
                        "table listener timed out"
                    ),
                }
            });
        }
    }
}
