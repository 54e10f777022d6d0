//! MQTT transport over `rumqttc`.
//!
//! The client half implements [`Transport`]; the event-loop half runs in a
//! background task that forwards inbound publishes over an `mpsc` channel
//! and reconnects with exponential backoff + jitter. Every successful
//! (re)connect bumps a counter on a `watch` channel so callers can
//! re-issue their subscriptions.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::message::{BusMessage, QoS};
use super::publisher::Transport;
use crate::error::Error;

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const REQUEST_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::AtMostOnce,
            QoS::AtLeastOnce => Self::AtLeastOnce,
            QoS::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Self::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => Self::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────

/// Exponential backoff configuration for broker reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub reconnect: ReconnectConfig,
}

impl MqttConfig {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(self.clean_session);
        if let Some(ref username) = self.username {
            let password = self
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            options.set_credentials(username, password);
        }
        options
    }
}

// ── MqttTransport ────────────────────────────────────────────────────

/// Handle to a running MQTT connection.
pub struct MqttTransport {
    client: AsyncClient,
    connections: watch::Receiver<u64>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and spawn the event loop. Returns immediately; the
    /// first connection attempt happens in the background.
    pub fn start(
        config: &MqttConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<BusMessage>) {
        let (client, eventloop) = AsyncClient::new(config.options(), REQUEST_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (connections_tx, connections) = watch::channel(0u64);

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "starting MQTT client"
        );

        let reconnect = config.reconnect.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            event_loop(eventloop, inbound_tx, connections_tx, reconnect, task_cancel).await;
        });

        (
            Self {
                client,
                connections,
                cancel,
                task: Mutex::new(Some(task)),
            },
            inbound_rx,
        )
    }

    /// Receiver whose value counts successful broker connections.
    pub fn connections(&self) -> watch::Receiver<u64> {
        self.connections.clone()
    }

    /// Send DISCONNECT and wait for the event loop to wind down. If the
    /// broker is unreachable the loop is cancelled after a short grace period.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }

        let joined = match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                self.cancel.cancel();
                task.await
            }
        };
        if let Err(e) = joined {
            tracing::warn!(error = %e, "MQTT event loop task failed");
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), Error> {
        self.client
            .publish(topic, qos.into(), retained, payload.to_vec())
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), Error> {
        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

// ── Background event loop ────────────────────────────────────────────

/// Poll the connection: forward publishes, count connects, back off on error.
async fn event_loop(
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<BusMessage>,
    connections: watch::Sender<u64>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(session_present = ack.session_present, "MQTT connected");
                attempt = 0;
                connections.send_modify(|count| *count += 1);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos.into(),
                    retained: publish.retain,
                };
                if inbound.send(message).await.is_err() {
                    tracing::debug!("inbound receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("broker sent DISCONNECT");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("MQTT disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let delay = calculate_backoff(attempt, &reconnect);
                tracing::warn!(
                    error = %e,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "MQTT connection error, backing off"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                attempt = attempt.saturating_add(1);
            }
        }
    }

    tracing::debug!("MQTT event loop exiting");
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 ± 0.25)`
///
/// The jitter is derived from the attempt number, so it is deterministic.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(32)).unwrap_or(32);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}
