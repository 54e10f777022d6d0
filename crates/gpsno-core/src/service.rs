// ── Sync service ──
//
// Wires the reconcilers to both sides: table listeners on the change
// capture, handlers on the bus router. Owns the background tasks (inbound
// pump, re-subscribe on reconnect) and exposes the lifecycle as a `watch`
// channel the same way the change capture does.

use std::sync::Arc;

use gpsno_api::{
    BusMessage, ChangeCaptureListener, Publisher, Subscriber, TimeSeriesSink, TopicSpace,
    Transport,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::CoreError;
use crate::measurement::MeasurementHandler;
use crate::reconcile::{ClusterReconciler, StationReconciler, SyncReport};
use crate::store::{CLUSTERS_TABLE, Datastore, STATIONS_TABLE};

/// Service lifecycle observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// Which entity kinds a full resync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SyncScope {
    Stations,
    Clusters,
    #[default]
    All,
}

/// The connected half of the bus, as produced by a transport's `start`.
pub struct BusLink {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::Receiver<BusMessage>,
    /// Counts successful (re)connects; each bump re-issues subscriptions.
    pub connections: watch::Receiver<u64>,
}

// ── Reconcilers ──────────────────────────────────────────────────────

/// Both reconcilers, built over one store and publisher.
#[derive(Clone)]
pub struct Reconcilers {
    pub stations: Arc<StationReconciler>,
    pub clusters: Arc<ClusterReconciler>,
}

impl Reconcilers {
    pub fn new(store: Arc<dyn Datastore>, publisher: Publisher, topics: Arc<TopicSpace>) -> Self {
        let clusters = Arc::new(ClusterReconciler::new(
            Arc::clone(&store),
            publisher.clone(),
            Arc::clone(&topics),
        ));
        let stations = Arc::new(StationReconciler::new(
            store,
            publisher,
            topics,
            Arc::clone(&clusters),
        ));
        Self { stations, clusters }
    }

    /// Full resync of the given kinds. Stations go first so cluster
    /// snapshots reflect the freshest membership.
    pub async fn sync(&self, scope: SyncScope) -> Result<SyncReport, CoreError> {
        let mut report = SyncReport::default();
        if matches!(scope, SyncScope::Stations | SyncScope::All) {
            report = report + self.stations.sync_all().await?;
        }
        if matches!(scope, SyncScope::Clusters | SyncScope::All) {
            report = report + self.clusters.sync_all().await?;
        }
        Ok(report)
    }
}

// ── SyncService ──────────────────────────────────────────────────────

/// Cheaply cloneable handle to the running service.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: SyncConfig,
    topics: Arc<TopicSpace>,
    reconcilers: Reconcilers,
    measurements: Option<Arc<MeasurementHandler>>,
    subscriber: Arc<Subscriber>,
    capture: ChangeCaptureListener,
    inbound: Mutex<Option<mpsc::Receiver<BusMessage>>>,
    connections: watch::Receiver<u64>,
    state: watch::Sender<ServiceState>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    /// Build the service. Nothing runs until [`start()`](Self::start).
    ///
    /// Measurements are only ingested when a `sink` is given.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn Datastore>,
        bus: BusLink,
        capture: ChangeCaptureListener,
        sink: Option<Arc<dyn TimeSeriesSink>>,
    ) -> Self {
        let topics = Arc::new(TopicSpace::new(config.base_topic.clone()));
        let publisher = Publisher::new(
            Arc::clone(&bus.transport),
            config.qos,
            config.publish_timeout,
        );
        let reconcilers = Reconcilers::new(store, publisher, Arc::clone(&topics));
        let measurements =
            sink.map(|sink| Arc::new(MeasurementHandler::new(sink, Arc::clone(&topics))));
        let subscriber = Arc::new(Subscriber::new(
            bus.transport,
            Arc::default(),
            config.handler_timeout,
        ));
        let (state, _) = watch::channel(ServiceState::Stopped);

        Self {
            inner: Arc::new(ServiceInner {
                config,
                topics,
                reconcilers,
                measurements,
                subscriber,
                capture,
                inbound: Mutex::new(Some(bus.inbound)),
                connections: bus.connections,
                state,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn reconcilers(&self) -> &Reconcilers {
        &self.inner.reconcilers
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.inner.subscriber
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Register handlers and listeners, start change capture, subscribe the
    /// topic filters, and (optionally) publish a baseline.
    ///
    /// Trigger installation failures are returned unchanged and leave the
    /// service `Failed`.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.state() != ServiceState::Stopped {
            return Err(CoreError::Internal(format!(
                "service cannot start while {}",
                self.state()
            )));
        }
        self.inner.state.send_replace(ServiceState::Starting);

        match self.start_inner().await {
            Ok(()) => {
                self.inner.state.send_replace(ServiceState::Running);
                info!(base_topic = %self.inner.topics.base(), "sync service running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "sync service failed to start");
                self.inner.state.send_replace(ServiceState::Failed);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        let router = inner.subscriber.router();
        let Reconcilers { stations, clusters } = inner.reconcilers.clone();

        router.register_handler(&inner.topics.stations_filter()?, stations.clone())?;
        router.register_handler(&inner.topics.clusters_filter()?, clusters.clone())?;
        if let Some(ref measurements) = inner.measurements {
            router.register_handler(&inner.topics.measurements_filter()?, measurements.clone())?;
        }

        inner
            .capture
            .register_listener(STATIONS_TABLE, stations)
            .await?;
        inner
            .capture
            .register_listener(CLUSTERS_TABLE, clusters)
            .await?;
        inner.capture.start().await?;

        let mut handles = inner.task_handles.lock().await;

        // Pump first so retained messages delivered on subscribe are consumed.
        if let Some(rx) = inner.inbound.lock().await.take() {
            let subscriber = Arc::clone(&inner.subscriber);
            let cancel = inner.cancel.clone();
            handles.push(tokio::spawn(async move {
                subscriber.run(rx, cancel).await;
            }));
        }

        for filter in router.filters() {
            inner.subscriber.subscribe(&filter, inner.config.qos).await?;
        }

        // Connects up to now are covered by the subscriptions just made.
        let mut connections = inner.connections.clone();
        connections.mark_unchanged();
        handles.push(tokio::spawn(resubscribe_task(
            Arc::clone(&inner.subscriber),
            connections,
            inner.cancel.clone(),
        )));
        drop(handles);

        if inner.config.resync_on_start {
            let report = inner.reconcilers.sync(SyncScope::All).await?;
            info!(
                published = report.published,
                failed = report.failed,
                "baseline sync finished"
            );
        }
        Ok(())
    }

    /// Resolve when change capture dies or the service is shut down.
    ///
    /// A lost capture connection is returned as an error; the caller
    /// decides whether to restart or exit.
    pub async fn wait(&self) -> Result<(), CoreError> {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Ok(()),
            result = self.inner.capture.join() => match result {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(error = %e, "change capture ended");
                    self.inner.state.send_replace(ServiceState::Failed);
                    Err(e.into())
                }
            },
        }
    }

    /// Stop capture and background tasks. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.capture.stop().await;
        self.inner.cancel.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task failed");
            }
        }
        drop(handles);

        if self.state() != ServiceState::Failed {
            self.inner.state.send_replace(ServiceState::Stopped);
        }
        debug!("sync service stopped");
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Re-issue every subscription after each broker reconnect.
async fn resubscribe_task(
    subscriber: Arc<Subscriber>,
    mut connections: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = connections.changed() => {
                if changed.is_err() {
                    break;
                }
                let connects = *connections.borrow_and_update();
                let restored = subscriber.resubscribe_all().await;
                debug!(connects, restored, "re-issued subscriptions after connect");
            }
        }
    }
}
