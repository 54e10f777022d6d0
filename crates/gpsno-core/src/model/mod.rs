// ── Domain model ──

pub mod cluster;
pub mod mac;
pub mod station;

use serde::{Deserialize, Deserializer};

pub use cluster::{Cluster, ClusterDto, ClusterSnapshot};
pub use mac::MacAddress;
pub use station::{STATION_NAME_PREFIX, Station, StationConfig, StationDto, UwbConfig, UwbMode};

/// Nullable columns and JSON `null` both decode to the type's default.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
