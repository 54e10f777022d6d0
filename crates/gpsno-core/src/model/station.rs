// ── Station ──
//
// A physical device identified by its hardware address. The same struct
// is used for stored rows, trigger row images, and the normalized form the
// reconciler publishes; `StationDto` is the wire projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mac::MacAddress;
use super::nullable;
use crate::error::CoreError;

/// Prefix of the display name derived for stations that arrive without one.
pub const STATION_NAME_PREFIX: &str = "GPS:No Station-";

// ── Configuration ────────────────────────────────────────────────────

/// Radio role of the UWB transceiver.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE", from = "String")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum UwbMode {
    Anchor,
    Tag,
    #[default]
    Unknown,
}

impl From<String> for UwbMode {
    /// Lenient: surrounding whitespace and case are ignored, anything
    /// unrecognized is `Unknown`.
    fn from(raw: String) -> Self {
        raw.trim().parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UwbConfig {
    #[serde(default)]
    pub mode: UwbMode,
}

/// Typed station configuration, stored as `jsonb`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uwb: Option<UwbConfig>,
}

// ── Station ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    /// Surrogate key; `0` until the row exists.
    #[serde(default)]
    pub id: i64,
    /// As received or stored; see [`Station::normalized`].
    pub mac_address: String,
    #[serde(default, deserialize_with = "nullable")]
    pub topic: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub config: StationConfig,
    #[serde(default)]
    pub cluster_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Station {
    /// A fresh, unsaved station with only its address set.
    pub fn new(mac_address: impl Into<String>) -> Self {
        Self {
            id: 0,
            mac_address: mac_address.into(),
            topic: String::new(),
            name: String::new(),
            config: StationConfig::default(),
            cluster_id: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    /// Build an unsaved station from external intent.
    pub fn from_dto(dto: &StationDto) -> Self {
        Self {
            topic: dto.topic.clone(),
            name: dto.name.clone(),
            config: dto.config.clone(),
            cluster_id: dto.cluster_id,
            ..Self::new(dto.mac_address.clone())
        }
    }

    pub fn mac(&self) -> Result<MacAddress, CoreError> {
        MacAddress::parse(&self.mac_address)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Canonical form: address canonicalized, missing name and topic
    /// derived from it. Normalizing a normalized station is a no-op.
    ///
    /// Fails with `ValidationFailed` when the address is missing or invalid.
    pub fn normalized(&self) -> Result<Self, CoreError> {
        let mac = self.mac()?;
        let name = self.name.trim();
        let topic = self.topic.trim();

        Ok(Self {
            mac_address: mac.to_string(),
            name: if name.is_empty() {
                format!("{STATION_NAME_PREFIX}{}", mac.suffix())
            } else {
                name.to_owned()
            },
            topic: if topic.is_empty() {
                mac.compact()
            } else {
                topic.to_owned()
            },
            ..self.clone()
        })
    }

    /// Apply external intent to a stored station.
    ///
    /// The address never changes. Name and topic left empty by the sender
    /// keep their stored values. Applying intent revives a soft-deleted
    /// station.
    pub fn merged_with(&self, dto: &StationDto) -> Self {
        let keep = |incoming: &str, stored: &str| {
            if incoming.trim().is_empty() {
                stored.to_owned()
            } else {
                incoming.to_owned()
            }
        };

        Self {
            name: keep(&dto.name, &self.name),
            topic: keep(&dto.topic, &self.topic),
            config: dto.config.clone(),
            cluster_id: dto.cluster_id,
            deleted_at: None,
            ..self.clone()
        }
    }

    pub fn to_dto(&self) -> StationDto {
        StationDto {
            mac_address: self.mac_address.clone(),
            topic: self.topic.clone(),
            name: self.name.clone(),
            cluster_id: self.cluster_id,
            config: self.config.clone(),
        }
    }
}

// ── Wire projection ──────────────────────────────────────────────────

/// What a station looks like on the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationDto {
    /// Missing or `null` decodes as empty and fails validation, not parsing.
    #[serde(default, deserialize_with = "nullable")]
    pub mac_address: String,
    #[serde(default, deserialize_with = "nullable")]
    pub topic: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default)]
    pub cluster_id: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub config: StationConfig,
}
