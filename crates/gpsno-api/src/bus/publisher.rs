// ── Publishing ──
//
// `Transport` is the seam to the concrete bus client. `Publisher` layers
// per-call timeouts and the entity envelope on top of it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use super::message::{QoS, WireMessage};
use crate::error::Error;

/// Default bound on a single publish round-trip.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal bus client surface.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), Error>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), Error>;
}

/// Timeout-bounded publisher shared by every reconciler.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    qos: QoS,
    timeout: Duration,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, qos: QoS, timeout: Duration) -> Self {
        Self {
            transport,
            qos,
            timeout,
        }
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Publish a raw payload. Fails with [`Error::Timeout`] if the client
    /// does not accept it within the configured bound.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Result<(), Error> {
        let payload = payload.into();
        tokio::time::timeout(
            self.timeout,
            self.transport.publish(topic, payload, qos, retained),
        )
        .await
        .map_err(|_| Error::timeout("publish", self.timeout))?
    }

    /// Serialize `data` as JSON and publish it unwrapped.
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        topic: &str,
        data: &T,
        retained: bool,
    ) -> Result<(), Error> {
        let payload = serde_json::to_vec(data)?;
        self.publish(topic, payload, self.qos, retained).await
    }

    /// Publish the authoritative state of an entity: wrapped in the envelope,
    /// tagged `"SYNC"`, retained.
    pub async fn publish_entity<T: Serialize + Sync>(
        &self,
        topic: &str,
        data: &T,
    ) -> Result<(), Error> {
        tracing::debug!(topic, "publishing entity");
        self.publish_json(topic, &WireMessage::internal(data), true)
            .await
    }

    /// Remove the retained message at `topic`.
    pub async fn clear_retained(&self, topic: &str) -> Result<(), Error> {
        tracing::debug!(topic, "clearing retained message");
        self.publish(topic, Bytes::new(), self.qos, true).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Capture {
        published: Mutex<Vec<(String, Bytes, QoS, bool)>>,
    }

    #[async_trait]
    impl Transport for Capture {
        async fn publish(
            &self,
            topic: &str,
            payload: Bytes,
            qos: QoS,
            retained: bool,
        ) -> Result<(), Error> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_owned(), payload, qos, retained));
            Ok(())
        }

        async fn subscribe(&self, _filter: &str, _qos: QoS) -> Result<(), Error> {
            Ok(())
        }
    }

    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn publish(&self, _: &str, _: Bytes, _: QoS, _: bool) -> Result<(), Error> {
            std::future::pending().await
        }

        async fn subscribe(&self, _filter: &str, _qos: QoS) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn entity_is_wrapped_tagged_and_retained() {
        let capture = Arc::new(Capture::default());
        let publisher = Publisher::new(capture.clone(), QoS::AtLeastOnce, DEFAULT_PUBLISH_TIMEOUT);

        publisher
            .publish_entity("gps-no/v1/clusters/1", &serde_json::json!({ "id": 1 }))
            .await
            .unwrap();

        let published = capture.published.lock().unwrap();
        let (topic, payload, qos, retained) = &published[0];
        assert_eq!(topic, "gps-no/v1/clusters/1");
        assert_eq!(*qos, QoS::AtLeastOnce);
        assert!(retained);
        let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value["source"], "SYNC");
        assert_eq!(value["data"]["id"], 1);
    }

    #[tokio::test]
    async fn clear_publishes_empty_retained_payload() {
        let capture = Arc::new(Capture::default());
        let publisher = Publisher::new(capture.clone(), QoS::ExactlyOnce, DEFAULT_PUBLISH_TIMEOUT);

        publisher.clear_retained("gps-no/v1/stations/x").await.unwrap();

        let published = capture.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.is_empty());
        assert!(published[0].3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_times_out() {
        let publisher = Publisher::new(Arc::new(Stalled), QoS::AtLeastOnce, Duration::from_secs(2));
        let err = publisher
            .publish("t", "x", QoS::AtLeastOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "publish", timeout_ms: 2000 }));
    }
}
