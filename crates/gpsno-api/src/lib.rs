// gpsno-api: wire-level plumbing for the station/cluster sync service
//
// Everything that touches a socket lives here: the MQTT bus (topic
// addressing, routing, publish/subscribe), Postgres LISTEN/NOTIFY change
// capture, and the InfluxDB line-protocol writer. `gpsno-core` builds the
// reconciliation logic on top of these pieces.

pub mod bus;
pub mod capture;
pub mod error;
pub mod influx;
pub mod sink;
pub mod topic;

pub use bus::{
    BusMessage, MessageHandler, Origin, Publisher, QoS, Router, SYNC_SOURCE, Subscriber,
    Transport, WireMessage,
};
pub use capture::{
    CaptureConfig, CaptureState, Change, ChangeCaptureListener, NotificationSource, Operation,
    TableChangeEvent, TableListener, TriggerInstaller,
};
pub use error::{BoxError, Error};
pub use influx::{InfluxConfig, InfluxWriter};
pub use sink::{BatchConfig, BufferedSink, FieldValue, Point, TimeSeriesSink};
pub use topic::{TopicMatcher, TopicSpace};
