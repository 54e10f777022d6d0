#![allow(clippy::unwrap_used)]
// Receive-loop tests for `ChangeCaptureListener` with an in-memory source.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use gpsno_api::{
    BoxError, CaptureConfig, CaptureState, ChangeCaptureListener, Error, NotificationSource,
    TableChangeEvent, TableListener, TriggerInstaller,
};

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Probe {
    listens: Arc<Mutex<Vec<String>>>,
    pings: Arc<AtomicUsize>,
    ping_fails: Arc<AtomicBool>,
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<String, Error>>,
    probe: Probe,
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn listen(&mut self, channel: &str) -> Result<(), Error> {
        self.probe.listens.lock().unwrap().push(channel.to_owned());
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, Error> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(Error::ConnectionLost("source closed".into())),
        }
    }

    async fn ping(&mut self) -> Result<(), Error> {
        self.probe.pings.fetch_add(1, Ordering::SeqCst);
        if self.probe.ping_fails.load(Ordering::SeqCst) {
            Err(Error::ConnectionLost("probe failed".into()))
        } else {
            Ok(())
        }
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

struct Forward {
    name: &'static str,
    tx: mpsc::UnboundedSender<(&'static str, TableChangeEvent)>,
}

#[async_trait]
impl TableListener for Forward {
    fn name(&self) -> &str {
        self.name
    }

    async fn on_change(&self, event: &TableChangeEvent) -> Result<(), BoxError> {
        self.tx.send((self.name, event.clone()))?;
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl TableListener for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn on_change(&self, _event: &TableChangeEvent) -> Result<(), BoxError> {
        Err("listener exploded".into())
    }
}

struct Hanging;

#[async_trait]
impl TableListener for Hanging {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn on_change(&self, _event: &TableChangeEvent) -> Result<(), BoxError> {
        std::future::pending().await
    }
}

struct Gated {
    started: Arc<AtomicUsize>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl TableListener for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn on_change(&self, _event: &TableChangeEvent) -> Result<(), BoxError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.acquire().await?.forget();
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    capture: ChangeCaptureListener,
    installer: Arc<RecordingInstaller>,
    probe: Probe,
    notify: mpsc::UnboundedSender<Result<String, Error>>,
}

fn harness_with(config: CaptureConfig, installer: RecordingInstaller) -> Harness {
    let (notify, rx) = mpsc::unbounded_channel();
    let probe = Probe::default();
    let installer = Arc::new(installer);
    let capture = ChangeCaptureListener::new(
        config,
        installer.clone(),
        Box::new(ChannelSource {
            rx,
            probe: probe.clone(),
        }),
        CancellationToken::new(),
    );
    Harness {
        capture,
        installer,
        probe,
        notify,
    }
}

fn harness() -> Harness {
    harness_with(CaptureConfig::default(), RecordingInstaller::default())
}

fn insert(table: &str, id: i64) -> String {
    json!({
        "operation": "INSERT",
        "table": table,
        "old_data": null,
        "new_data": { "id": id },
        "timestamp": "2025-03-01T12:00:00Z"
    })
    .to_string()
}

fn forward(
    name: &'static str,
    tx: &mpsc::UnboundedSender<(&'static str, TableChangeEvent)>,
) -> Arc<Forward> {
    Arc::new(Forward {
        name,
        tx: tx.clone(),
    })
}

async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<(&'static str, TableChangeEvent)>,
) -> Option<(&'static str, TableChangeEvent)> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .ok()
        .flatten()
}

// ── Initialization ──────────────────────────────────────────────────

#[tokio::test]
async fn initialize_installs_function_then_sorted_triggers() {
    let h = harness();
    let (tx, _rx) = mpsc::unbounded_channel();
    h.capture.register_listener("stations", forward("s", &tx)).await.unwrap();
    h.capture.register_listener("clusters", forward("c", &tx)).await.unwrap();
    h.capture.register_listener("stations", forward("s2", &tx)).await.unwrap();

    h.capture.initialize().await.unwrap();
    h.capture.initialize().await.unwrap();

    let calls = h.installer.calls.lock().unwrap().clone();
    assert_eq!(
        calls[..3],
        [
            "function:table_changes".to_owned(),
            "trigger:clusters".to_owned(),
            "trigger:stations".to_owned(),
        ]
    );
    assert_eq!(*h.probe.listens.lock().unwrap(), vec!["table_changes"]);
    assert_eq!(h.capture.state(), CaptureState::Initializing);
}

#[tokio::test]
async fn installer_failure_is_fatal() {
    let h = harness_with(
        CaptureConfig::default(),
        RecordingInstaller {
            fail: true,
            ..RecordingInstaller::default()
        },
    );

    assert!(h.capture.initialize().await.is_err());
    assert_eq!(h.capture.state(), CaptureState::Stopped);
    assert!(h.probe.listens.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_table_name_is_rejected() {
    let h = harness();
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = h
        .capture
        .register_listener("stations; drop", forward("s", &tx))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidIdentifier(_)));
    assert!(h.capture.tables().is_empty());
}

// ── Dispatch ────────────────────────────────────────────────────────

#[tokio::test]
async fn dispatches_to_every_listener_of_the_table() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.capture.register_listener("stations", forward("a", &tx)).await.unwrap();
    h.capture.register_listener("stations", forward("b", &tx)).await.unwrap();
    h.capture.register_listener("clusters", forward("c", &tx)).await.unwrap();
    h.capture.start().await.unwrap();
    assert_eq!(h.capture.state(), CaptureState::Listening);

    h.notify.send(Ok(insert("stations", 1))).unwrap();

    let mut got = vec![next_event(&mut rx).await.unwrap(), next_event(&mut rx).await.unwrap()];
    got.sort_by_key(|(name, _)| *name);
    assert_eq!(got[0].0, "a");
    assert_eq!(got[1].0, "b");
    assert!(got.iter().all(|(_, e)| e.table == "stations"));

    h.capture.stop().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_and_unwatched_notifications_are_dropped() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.capture.register_listener("stations", forward("s", &tx)).await.unwrap();
    h.capture.start().await.unwrap();

    h.notify.send(Ok("not json".into())).unwrap();
    h.notify.send(Ok(insert("devices", 5))).unwrap();
    h.notify.send(Ok(insert("stations", 7))).unwrap();

    let (_, event) = next_event(&mut rx).await.unwrap();
    assert_eq!(event.table, "stations");
    assert_eq!(event.new_data.unwrap()["id"], 7);
    assert_eq!(h.capture.state(), CaptureState::Listening);

    h.capture.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failing_and_slow_listeners_do_not_block_siblings() {
    let config = CaptureConfig {
        dispatch_timeout: Duration::from_secs(1),
        ..CaptureConfig::default()
    };
    let h = harness_with(config, RecordingInstaller::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.capture.register_listener("stations", Arc::new(Failing)).await.unwrap();
    h.capture.register_listener("stations", Arc::new(Hanging)).await.unwrap();
    h.capture.register_listener("stations", forward("ok", &tx)).await.unwrap();
    h.capture.start().await.unwrap();

    h.notify.send(Ok(insert("stations", 1))).unwrap();
    assert_eq!(next_event(&mut rx).await.unwrap().0, "ok");

    h.notify.send(Ok(insert("stations", 2))).unwrap();
    let (_, event) = next_event(&mut rx).await.unwrap();
    assert_eq!(event.new_data.unwrap()["id"], 2);

    h.capture.stop().await;
    h.capture.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn in_flight_dispatches_are_bounded() {
    let config = CaptureConfig {
        max_in_flight: 1,
        ..CaptureConfig::default()
    };
    let h = harness_with(config, RecordingInstaller::default());
    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Semaphore::new(0));
    h.capture
        .register_listener(
            "stations",
            Arc::new(Gated {
                started: Arc::clone(&started),
                release: Arc::clone(&release),
            }),
        )
        .await
        .unwrap();
    h.capture.start().await.unwrap();

    h.notify.send(Ok(insert("stations", 1))).unwrap();
    h.notify.send(Ok(insert("stations", 2))).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    release.add_permits(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);

    release.add_permits(1);
    h.capture.stop().await;
}

#[tokio::test]
async fn runtime_registration_installs_trigger() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.capture.start().await.unwrap();

    h.capture.register_listener("clusters", forward("late", &tx)).await.unwrap();
    assert!(
        h.installer
            .calls
            .lock()
            .unwrap()
            .contains(&"trigger:clusters".to_owned())
    );

    h.notify.send(Ok(insert("clusters", 3))).unwrap();
    assert_eq!(next_event(&mut rx).await.unwrap().0, "late");
    h.capture.stop().await;
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn lost_connection_surfaces_from_join() {
    let h = harness();
    h.capture.start().await.unwrap();

    h.notify
        .send(Err(Error::ConnectionLost("server closed".into())))
        .unwrap();

    let err = h.capture.join().await.unwrap_err();
    assert!(err.is_connection_lost());
    assert_eq!(h.capture.state(), CaptureState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn idle_connection_is_probed() {
    let config = CaptureConfig {
        idle_probe: Duration::from_secs(90),
        ..CaptureConfig::default()
    };
    let h = harness_with(config, RecordingInstaller::default());
    h.capture.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(h.probe.pings.load(Ordering::SeqCst) >= 2);

    h.probe.ping_fails.store(true, Ordering::SeqCst);
    let err = h.capture.join().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_)));
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let h = harness();
    h.capture.start().await.unwrap();
    assert!(matches!(h.capture.start().await, Err(Error::AlreadyStarted)));
    h.capture.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_halts_dispatch() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.capture.register_listener("stations", forward("s", &tx)).await.unwrap();
    h.capture.start().await.unwrap();

    h.capture.stop().await;
    h.capture.stop().await;
    assert_eq!(h.capture.state(), CaptureState::Stopped);
    h.capture.join().await.unwrap();

    let _ = h.notify.send(Ok(insert("stations", 1)));
    let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(late.is_err(), "no dispatch expected after stop");
}
