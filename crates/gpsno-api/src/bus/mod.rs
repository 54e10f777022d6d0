// ── Message bus ──
//
// Router + publisher + subscriber over a `Transport` seam. The concrete
// MQTT client lives in `mqtt`; tests plug in recording transports.

pub mod message;
pub mod mqtt;
pub mod publisher;
pub mod router;
pub mod subscriber;

pub use message::{BusMessage, Origin, QoS, SYNC_SOURCE, WireMessage};
pub use mqtt::{MqttConfig, MqttTransport, ReconnectConfig};
pub use publisher::{DEFAULT_PUBLISH_TIMEOUT, Publisher, Transport};
pub use router::{MessageHandler, Router};
pub use subscriber::{DEFAULT_HANDLER_TIMEOUT, Subscriber};
