#![allow(clippy::unwrap_used)]
// Lifecycle tests for `SyncService` with in-memory bus, store and capture.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use gpsno_api::{
    BusMessage, CaptureConfig, ChangeCaptureListener, Error, NotificationSource, Point, QoS,
    TimeSeriesSink, Transport, TriggerInstaller,
};
use gpsno_core::{
    BusLink, CoreError, MemoryDatastore, ServiceState, Station, SyncConfig, SyncService,
};

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingTransport {
    published: Mutex<Vec<(String, Bytes)>>,
    subscribed: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        _qos: QoS,
        _retained: bool,
    ) -> Result<(), Error> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), Error> {
        self.subscribed.lock().unwrap().push(filter.to_owned());
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn listen(&mut self, _channel: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, Error> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::ConnectionLost("source closed".into()))
    }

    async fn ping(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingInstaller {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl TriggerInstaller for RecordingInstaller {
    async fn install_function(&self, channel: &str) -> Result<(), Error> {
        if self.fail {
            return Err(Error::InvalidIdentifier("permission denied".into()));
        }
        self.calls.lock().unwrap().push(format!("function:{channel}"));
        Ok(())
    }

    async fn install_trigger(&self, table: &str) -> Result<(), Error> {
        self.calls.lock().unwrap().push(format!("trigger:{table}"));
        Ok(())
    }
}

#[derive(Default)]
struct CollectSink(Mutex<Vec<Point>>);

#[async_trait]
impl TimeSeriesSink for CollectSink {
    async fn write(&self, points: &[Point]) -> Result<(), Error> {
        self.0.lock().unwrap().extend_from_slice(points);
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    service: SyncService,
    store: Arc<MemoryDatastore>,
    transport: Arc<RecordingTransport>,
    installer: Arc<RecordingInstaller>,
    inbound: mpsc::Sender<BusMessage>,
    connections: watch::Sender<u64>,
    notify: mpsc::UnboundedSender<String>,
}

fn harness_with(installer: RecordingInstaller, sink: Option<Arc<dyn TimeSeriesSink>>) -> Harness {
    let store = Arc::new(MemoryDatastore::new());
    let transport = Arc::new(RecordingTransport::default());
    let installer = Arc::new(installer);
    let (inbound, inbound_rx) = mpsc::channel(16);
    let (connections, connections_rx) = watch::channel(1);
    let (notify, notify_rx) = mpsc::unbounded_channel();

    let capture = ChangeCaptureListener::new(
        CaptureConfig::default(),
        installer.clone(),
        Box::new(ChannelSource { rx: notify_rx }),
        CancellationToken::new(),
    );
    let bus = BusLink {
        transport: transport.clone(),
        inbound: inbound_rx,
        connections: connections_rx,
    };
    let service = SyncService::new(SyncConfig::default(), store.clone(), bus, capture, sink);

    Harness {
        service,
        store,
        transport,
        installer,
        inbound,
        connections,
        notify,
    }
}

fn harness() -> Harness {
    harness_with(RecordingInstaller::default(), None)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Start ───────────────────────────────────────────────────────────

#[tokio::test]
async fn start_installs_subscribes_and_publishes_baseline() {
    let h = harness();
    h.store
        .insert_station(Station::new("aa:bb:cc:dd:ee:ff").normalized().unwrap());

    h.service.start().await.unwrap();
    assert_eq!(h.service.state(), ServiceState::Running);

    assert_eq!(
        *h.installer.calls.lock().unwrap(),
        vec![
            "function:table_changes",
            "trigger:clusters",
            "trigger:stations"
        ]
    );
    assert_eq!(
        h.transport.subscribed(),
        vec!["gpsno/v1/stations/+", "gpsno/v1/clusters/+"]
    );
    assert_eq!(
        h.transport.topics(),
        vec!["gpsno/v1/stations/aabbccddeeff"]
    );

    h.service.shutdown().await;
}

#[tokio::test]
async fn measurements_are_subscribed_only_with_a_sink() {
    let sink = Arc::new(CollectSink::default());
    let h = harness_with(RecordingInstaller::default(), Some(sink.clone()));
    h.service.start().await.unwrap();

    assert_eq!(
        h.transport.subscribed(),
        vec![
            "gpsno/v1/stations/+",
            "gpsno/v1/clusters/+",
            "gpsno/v1/measurements/+"
        ]
    );

    let batch = json!({
        "source": "aa:bb:cc:dd:ee:ff",
        "data": [{ "value": 2.5, "type": "UWB", "unit": "M", "target": "aa:bb:cc:dd:ee:01" }]
    });
    h.inbound
        .send(BusMessage::new(
            "gpsno/v1/measurements/aabbccddeeff",
            batch.to_string(),
        ))
        .await
        .unwrap();
    eventually("measurement point", || !sink.0.lock().unwrap().is_empty()).await;
    assert_eq!(sink.0.lock().unwrap()[0].tags["station_id"], "aabbccddeeff");

    h.service.shutdown().await;
}

#[tokio::test]
async fn failed_trigger_install_leaves_service_failed() {
    let h = harness_with(
        RecordingInstaller {
            fail: true,
            ..RecordingInstaller::default()
        },
        None,
    );

    let err = h.service.start().await.unwrap_err();
    assert!(matches!(err, CoreError::Config { .. }), "got: {err:?}");
    assert_eq!(h.service.state(), ServiceState::Failed);
    assert!(h.transport.subscribed().is_empty());
}

#[tokio::test]
async fn second_start_is_rejected() {
    let h = harness();
    h.service.start().await.unwrap();

    assert!(h.service.start().await.is_err());
    assert_eq!(h.service.state(), ServiceState::Running);

    h.service.shutdown().await;
}

// ── Running ─────────────────────────────────────────────────────────

#[tokio::test]
async fn row_change_is_normalized_through_capture() {
    let h = harness();
    h.service.start().await.unwrap();
    let raw = h.store.insert_station(Station::new("AABBCCDDEEFF"));

    let payload = json!({
        "operation": "INSERT",
        "table": "stations",
        "old_data": null,
        "new_data": serde_json::to_value(&raw).unwrap(),
        "timestamp": "2024-05-01T10:00:00Z"
    });
    h.notify.send(payload.to_string()).unwrap();

    eventually("normalized write", || h.store.writes() == 1).await;
    let stored = h.store.station("aa:bb:cc:dd:ee:ff").unwrap();
    assert_eq!(stored.name, "GPS:No Station-DDEEFF");

    h.service.shutdown().await;
}

#[tokio::test]
async fn inbound_station_is_applied_and_published() {
    let h = harness();
    h.service.start().await.unwrap();

    let message = json!({ "data": { "mac_address": "aabbccddeeff" }, "source": "ui" });
    h.inbound
        .send(BusMessage::new(
            "gpsno/v1/stations/aabbccddeeff",
            message.to_string(),
        ))
        .await
        .unwrap();

    eventually("station created", || {
        h.store.station("aa:bb:cc:dd:ee:ff").is_some()
    })
    .await;
    eventually("station published", || {
        h.transport
            .topics()
            .contains(&"gpsno/v1/stations/aabbccddeeff".to_owned())
    })
    .await;

    h.service.shutdown().await;
}

#[tokio::test]
async fn reconnect_reissues_subscriptions() {
    let h = harness();
    h.service.start().await.unwrap();
    assert_eq!(h.transport.subscribed().len(), 2);

    h.connections.send(2).unwrap();
    eventually("resubscribe", || h.transport.subscribed().len() == 4).await;

    h.service.shutdown().await;
}

// ── Failure / shutdown ──────────────────────────────────────────────

#[tokio::test]
async fn lost_capture_connection_surfaces_from_wait() {
    let h = harness();
    h.service.start().await.unwrap();

    drop(h.notify);
    let err = tokio::time::timeout(Duration::from_secs(5), h.service.wait())
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, CoreError::CaptureLost { .. }), "got: {err:?}");
    assert!(err.is_fatal());
    assert_eq!(h.service.state(), ServiceState::Failed);

    h.service.shutdown().await;
    assert_eq!(h.service.state(), ServiceState::Failed);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_releases_wait() {
    let h = harness();
    h.service.start().await.unwrap();

    let waiter = {
        let service = h.service.clone();
        tokio::spawn(async move { service.wait().await })
    };

    h.service.shutdown().await;
    h.service.shutdown().await;
    assert_eq!(h.service.state(), ServiceState::Stopped);

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
