// ── Subscriptions and the inbound pump ──

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message::{BusMessage, QoS};
use super::publisher::Transport;
use super::router::Router;
use crate::error::Error;

/// Default bound on handling a single inbound message.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks active subscriptions and feeds inbound messages to the router.
pub struct Subscriber {
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    subscriptions: DashMap<String, QoS>,
    handler_timeout: Duration,
}

impl Subscriber {
    pub fn new(transport: Arc<dyn Transport>, router: Arc<Router>, handler_timeout: Duration) -> Self {
        Self {
            transport,
            router,
            subscriptions: DashMap::new(),
            handler_timeout,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Subscribe to `filter` and remember it for reconnects.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), Error> {
        self.transport.subscribe(filter, qos).await?;
        self.subscriptions.insert(filter.to_owned(), qos);
        tracing::info!(filter, ?qos, "subscribed");
        Ok(())
    }

    /// Re-issue every remembered subscription, e.g. after the broker
    /// dropped our session. Failures are logged; returns how many succeeded.
    pub async fn resubscribe_all(&self) -> usize {
        let mut restored = 0;
        for (filter, qos) in self.subscriptions() {
            match self.transport.subscribe(&filter, qos).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!(filter, error = %e, "resubscribe failed"),
            }
        }
        tracing::debug!(restored, "subscriptions restored");
        restored
    }

    /// Active subscriptions, sorted by filter.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        let mut subs: Vec<(String, QoS)> = self
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        subs.sort_by(|a, b| a.0.cmp(&b.0));
        subs
    }

    /// Route one message under a fresh handler timeout.
    pub async fn dispatch(&self, message: BusMessage) -> Result<(), Error> {
        tokio::time::timeout(self.handler_timeout, self.router.route(message))
            .await
            .map_err(|_| Error::timeout("message handler", self.handler_timeout))?
    }

    /// Pump messages from `inbound` into the router until cancelled or the
    /// sender side goes away. Messages are handled one at a time.
    pub async fn run(&self, mut inbound: mpsc::Receiver<BusMessage>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => {
                        tracing::debug!("inbound channel closed");
                        break;
                    }
                },
            };

            let topic = message.topic.clone();
            match self.dispatch(message).await {
                Ok(()) => {}
                Err(Error::NoHandler { .. }) => {
                    tracing::debug!(topic, "no handler for inbound message");
                }
                Err(e) => tracing::warn!(topic, error = %e, "inbound message handling failed"),
            }
        }
        tracing::debug!("inbound pump exiting");
    }
}
