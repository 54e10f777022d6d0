// ── Datastore ──
//
// Durable station/cluster state. Every create-or-update runs inside one
// transaction: the existing row is locked, compared, and only written when
// something actually changed, so a no-op never fires the change trigger.

#[cfg(any(test, feature = "testing"))]
mod memory;
mod postgres;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::{Cluster, ClusterSnapshot, MacAddress, Station};

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryDatastore;
pub use postgres::{CLUSTERS_TABLE, PgDatastore, STATIONS_TABLE};

/// Result of a create-or-update.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert<T> {
    Created(T),
    Updated(T),
    /// The stored row already matched; nothing was written.
    Unchanged(T),
}

impl<T> Upsert<T> {
    /// The row as it is stored now.
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(row) | Self::Updated(row) | Self::Unchanged(row) => row,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    // ── Stations ─────────────────────────────────────────────────────

    /// Look up by canonical address, soft-deleted rows included.
    async fn find_station(&self, mac: &MacAddress) -> Result<Option<Station>, CoreError>;

    /// Create or update keyed by `id` when set, by address otherwise.
    async fn upsert_station(&self, station: &Station) -> Result<Upsert<Station>, CoreError>;

    /// Every station that is not soft-deleted, ordered by address.
    async fn active_stations(&self) -> Result<Vec<Station>, CoreError>;

    // ── Clusters ─────────────────────────────────────────────────────

    /// Look up by key, soft-deleted rows included.
    async fn find_cluster(&self, id: i64) -> Result<Option<Cluster>, CoreError>;

    /// Look up by name, soft-deleted rows included.
    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, CoreError>;

    /// Create or update keyed by `id` when set, by name otherwise.
    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<Upsert<Cluster>, CoreError>;

    /// Canonical addresses of the cluster's non-deleted members, sorted.
    async fn cluster_members(&self, id: i64) -> Result<Vec<String>, CoreError>;

    /// Every non-deleted cluster with its members, read as one snapshot.
    async fn active_clusters(&self) -> Result<Vec<ClusterSnapshot>, CoreError>;
}

/// Station columns a create-or-update may change.
pub(crate) fn station_settings_differ(stored: &Station, next: &Station) -> bool {
    stored.mac_address != next.mac_address
        || stored.name != next.name
        || stored.topic != next.topic
        || stored.config != next.config
        || stored.cluster_id != next.cluster_id
        || stored.deleted_at != next.deleted_at
}

pub(crate) fn cluster_settings_differ(stored: &Cluster, next: &Cluster) -> bool {
    !stored.same_settings(next) || stored.deleted_at != next.deleted_at
}
