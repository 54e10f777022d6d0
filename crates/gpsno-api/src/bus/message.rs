// ── Bus message types ──
//
// Raw inbound messages, the delivery-quality enum, and the JSON envelope
// every entity payload is wrapped in.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Source tag stamped on every message this service publishes.
pub const SYNC_SOURCE: &str = "SYNC";

// ── QoS ──────────────────────────────────────────────────────────────

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

// ── BusMessage ───────────────────────────────────────────────────────

/// A message as received from the bus, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retained: false,
        }
    }

    /// Empty payloads are retained-message clears, never entity updates.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode the payload as a [`WireMessage`].
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<WireMessage<T>, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Read only the envelope's `source` tag, whatever `data` holds.
    pub fn origin(&self) -> Result<Origin, serde_json::Error> {
        #[derive(Deserialize)]
        struct Header {
            #[serde(default)]
            source: Origin,
        }

        serde_json::from_slice::<Header>(&self.payload).map(|header| header.source)
    }

    /// `true` when the envelope carries this service's own tag, even if the
    /// payload would not decode as the expected entity.
    pub fn is_echo(&self) -> bool {
        self.origin().is_ok_and(|origin| origin.is_internal())
    }
}

// ── Origin ───────────────────────────────────────────────────────────

/// Who produced a bus message.
///
/// On the wire this is the envelope's `source` string: `"SYNC"` means this
/// service published it, anything else (or nothing) came from outside.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Origin {
    Internal,
    #[default]
    Unknown,
    External(String),
}

impl Origin {
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal)
    }

    /// The external source identifier, if one was supplied.
    pub fn external_id(&self) -> Option<&str> {
        match self {
            Self::External(id) => Some(id),
            Self::Internal | Self::Unknown => None,
        }
    }
}

impl From<Option<String>> for Origin {
    fn from(source: Option<String>) -> Self {
        match source {
            Some(s) if s == SYNC_SOURCE => Self::Internal,
            Some(s) if !s.is_empty() => Self::External(s),
            _ => Self::Unknown,
        }
    }
}

impl From<Origin> for Option<String> {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Internal => Some(SYNC_SOURCE.to_owned()),
            Origin::External(s) => Some(s),
            Origin::Unknown => None,
        }
    }
}

// ── WireMessage ──────────────────────────────────────────────────────

/// JSON envelope: `{"data": <payload>, "source": "SYNC" | <other>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage<T> {
    pub data: T,
    #[serde(default)]
    pub source: Origin,
}

impl<T> WireMessage<T> {
    /// Wrap `data` as a self-originated message.
    pub fn internal(data: T) -> Self {
        Self {
            data,
            source: Origin::Internal,
        }
    }
}
