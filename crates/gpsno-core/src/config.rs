// ── Runtime service configuration ──
//
// Built by the binary from the loaded config file and handed to
// `SyncService`. Core never reads files or the environment itself.

use std::time::Duration;

use gpsno_api::QoS;
use gpsno_api::bus::{DEFAULT_HANDLER_TIMEOUT, DEFAULT_PUBLISH_TIMEOUT};

/// Default root of the topic tree.
pub const DEFAULT_BASE_TOPIC: &str = "gpsno";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the topic tree, e.g. `gpsno` for `gpsno/v1/stations/+`.
    pub base_topic: String,
    /// Delivery guarantee for publishes and subscriptions.
    pub qos: QoS,
    /// Bound on a single publish round-trip.
    pub publish_timeout: Duration,
    /// Bound on handling one inbound message.
    pub handler_timeout: Duration,
    /// Publish every station and cluster once at startup.
    pub resync_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_topic: DEFAULT_BASE_TOPIC.to_owned(),
            qos: QoS::default(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            resync_on_start: true,
        }
    }
}
