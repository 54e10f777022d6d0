// ── Postgres datastore ──
//
// Queries are checked at runtime (`query_as`) so the crate builds without
// a live database. Rows map through private `FromRow` structs because
// several columns are nullable in the schema but not in the domain model.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use super::{Datastore, Upsert, cluster_settings_differ, station_settings_differ};
use crate::error::CoreError;
use crate::model::{Cluster, ClusterSnapshot, MacAddress, Station, StationConfig};

pub const STATIONS_TABLE: &str = "stations";
pub const CLUSTERS_TABLE: &str = "clusters";

const STATION_COLUMNS: &str =
    "id, mac_address, topic, name, config, cluster_id, created_at, updated_at, deleted_at";
const CLUSTER_COLUMNS: &str = "id, name, description, created_at, updated_at, deleted_at";

// ── Row mapping ──────────────────────────────────────────────────────

#[derive(FromRow)]
struct StationRow {
    id: i64,
    mac_address: String,
    topic: Option<String>,
    name: Option<String>,
    config: Option<Json<StationConfig>>,
    cluster_id: Option<i64>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<StationRow> for Station {
    fn from(row: StationRow) -> Self {
        Self {
            id: row.id,
            mac_address: row.mac_address,
            topic: row.topic.unwrap_or_default(),
            name: row.name.unwrap_or_default(),
            config: row.config.map(|c| c.0).unwrap_or_default(),
            cluster_id: row.cluster_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(FromRow)]
struct ClusterRow {
    id: i64,
    name: String,
    description: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<ClusterRow> for Cluster {
    fn from(row: ClusterRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description.unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    #[sqlx(flatten)]
    cluster: ClusterRow,
    stations: Vec<String>,
}

/// `INSERT … ON CONFLICT … RETURNING …, (xmax = 0) AS inserted`: the flag is
/// false when the conflict branch updated a row inserted concurrently.
#[derive(FromRow)]
struct InsertedStation {
    #[sqlx(flatten)]
    row: StationRow,
    inserted: bool,
}

#[derive(FromRow)]
struct InsertedCluster {
    #[sqlx(flatten)]
    row: ClusterRow,
    inserted: bool,
}

fn insert_outcome<T>(inserted: bool, row: T) -> Upsert<T> {
    if inserted {
        Upsert::Created(row)
    } else {
        Upsert::Updated(row)
    }
}

// ── PgDatastore ──────────────────────────────────────────────────────

/// Datastore over the `stations` and `clusters` tables.
#[derive(Debug, Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_station(
        tx: &mut Transaction<'_, Postgres>,
        station: &Station,
    ) -> Result<Option<Station>, CoreError> {
        let row: Option<StationRow> = if station.id > 0 {
            sqlx::query_as(&format!(
                "SELECT {STATION_COLUMNS} FROM {STATIONS_TABLE} WHERE id = $1 FOR UPDATE"
            ))
            .bind(station.id)
            .fetch_optional(&mut **tx)
            .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {STATION_COLUMNS} FROM {STATIONS_TABLE} WHERE mac_address = $1 FOR UPDATE"
            ))
            .bind(&station.mac_address)
            .fetch_optional(&mut **tx)
            .await?
        };
        Ok(row.map(Station::from))
    }

    async fn lock_cluster(
        tx: &mut Transaction<'_, Postgres>,
        cluster: &Cluster,
    ) -> Result<Option<Cluster>, CoreError> {
        let row: Option<ClusterRow> = if cluster.id > 0 {
            sqlx::query_as(&format!(
                "SELECT {CLUSTER_COLUMNS} FROM {CLUSTERS_TABLE} WHERE id = $1 FOR UPDATE"
            ))
            .bind(cluster.id)
            .fetch_optional(&mut **tx)
            .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {CLUSTER_COLUMNS} FROM {CLUSTERS_TABLE} WHERE name = $1 FOR UPDATE"
            ))
            .bind(&cluster.name)
            .fetch_optional(&mut **tx)
            .await?
        };
        Ok(row.map(Cluster::from))
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn find_station(&self, mac: &MacAddress) -> Result<Option<Station>, CoreError> {
        let row: Option<StationRow> = sqlx::query_as(&format!(
            "SELECT {STATION_COLUMNS} FROM {STATIONS_TABLE} WHERE mac_address = $1"
        ))
        .bind(mac.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Station::from))
    }

    async fn upsert_station(&self, station: &Station) -> Result<Upsert<Station>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = match Self::lock_station(&mut tx, station).await? {
            Some(stored) if !station_settings_differ(&stored, station) => Upsert::Unchanged(stored),
            Some(stored) => {
                let row: StationRow = sqlx::query_as(&format!(
                    "UPDATE {STATIONS_TABLE} SET mac_address = $2, topic = $3, name = $4, \
                     config = $5, cluster_id = $6, deleted_at = $7, updated_at = now() \
                     WHERE id = $1 RETURNING {STATION_COLUMNS}"
                ))
                .bind(stored.id)
                .bind(&station.mac_address)
                .bind(&station.topic)
                .bind(&station.name)
                .bind(Json(&station.config))
                .bind(station.cluster_id)
                .bind(station.deleted_at)
                .fetch_one(&mut *tx)
                .await?;
                Upsert::Updated(row.into())
            }
            None => {
                let upserted: InsertedStation = sqlx::query_as(&format!(
                    "INSERT INTO {STATIONS_TABLE} \
                     (mac_address, topic, name, config, cluster_id, deleted_at, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, now(), now()) \
                     ON CONFLICT (mac_address) DO UPDATE SET topic = EXCLUDED.topic, \
                     name = EXCLUDED.name, config = EXCLUDED.config, \
                     cluster_id = EXCLUDED.cluster_id, deleted_at = EXCLUDED.deleted_at, \
                     updated_at = now() \
                     RETURNING {STATION_COLUMNS}, (xmax = 0) AS inserted"
                ))
                .bind(&station.mac_address)
                .bind(&station.topic)
                .bind(&station.name)
                .bind(Json(&station.config))
                .bind(station.cluster_id)
                .bind(station.deleted_at)
                .fetch_one(&mut *tx)
                .await?;
                insert_outcome(upserted.inserted, upserted.row.into())
            }
        };

        tx.commit().await?;
        if result.is_write() {
            tracing::debug!(mac = %station.mac_address, "station persisted");
        }
        Ok(result)
    }

    async fn active_stations(&self) -> Result<Vec<Station>, CoreError> {
        let rows: Vec<StationRow> = sqlx::query_as(&format!(
            "SELECT {STATION_COLUMNS} FROM {STATIONS_TABLE} \
             WHERE deleted_at IS NULL ORDER BY mac_address"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Station::from).collect())
    }

    async fn find_cluster(&self, id: i64) -> Result<Option<Cluster>, CoreError> {
        let row: Option<ClusterRow> = sqlx::query_as(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM {CLUSTERS_TABLE} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Cluster::from))
    }

    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, CoreError> {
        let row: Option<ClusterRow> = sqlx::query_as(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM {CLUSTERS_TABLE} WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Cluster::from))
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<Upsert<Cluster>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = match Self::lock_cluster(&mut tx, cluster).await? {
            Some(stored) if !cluster_settings_differ(&stored, cluster) => Upsert::Unchanged(stored),
            Some(stored) => {
                let row: ClusterRow = sqlx::query_as(&format!(
                    "UPDATE {CLUSTERS_TABLE} SET name = $2, description = $3, deleted_at = $4, \
                     updated_at = now() WHERE id = $1 RETURNING {CLUSTER_COLUMNS}"
                ))
                .bind(stored.id)
                .bind(&cluster.name)
                .bind(&cluster.description)
                .bind(cluster.deleted_at)
                .fetch_one(&mut *tx)
                .await?;
                Upsert::Updated(row.into())
            }
            None => {
                let upserted: InsertedCluster = sqlx::query_as(&format!(
                    "INSERT INTO {CLUSTERS_TABLE} (name, description, deleted_at, created_at, updated_at) \
                     VALUES ($1, $2, $3, now(), now()) \
                     ON CONFLICT (name) DO UPDATE SET description = EXCLUDED.description, \
                     deleted_at = EXCLUDED.deleted_at, updated_at = now() \
                     RETURNING {CLUSTER_COLUMNS}, (xmax = 0) AS inserted"
                ))
                .bind(&cluster.name)
                .bind(&cluster.description)
                .bind(cluster.deleted_at)
                .fetch_one(&mut *tx)
                .await?;
                insert_outcome(upserted.inserted, upserted.row.into())
            }
        };

        tx.commit().await?;
        if result.is_write() {
            tracing::debug!(cluster = %cluster.name, "cluster persisted");
        }
        Ok(result)
    }

    async fn cluster_members(&self, id: i64) -> Result<Vec<String>, CoreError> {
        let members: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT mac_address FROM {STATIONS_TABLE} \
             WHERE cluster_id = $1 AND deleted_at IS NULL ORDER BY mac_address"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn active_clusters(&self) -> Result<Vec<ClusterSnapshot>, CoreError> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT c.id, c.name, c.description, c.created_at, c.updated_at, c.deleted_at, \
             COALESCE(array_agg(s.mac_address ORDER BY s.mac_address) \
                      FILTER (WHERE s.id IS NOT NULL), '{{}}') AS stations \
             FROM {CLUSTERS_TABLE} c \
             LEFT JOIN {STATIONS_TABLE} s ON s.cluster_id = c.id AND s.deleted_at IS NULL \
             WHERE c.deleted_at IS NULL \
             GROUP BY c.id ORDER BY c.id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ClusterSnapshot {
                cluster: row.cluster.into(),
                stations: row.stations,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_insert_reports_an_update() {
        assert_eq!(insert_outcome(true, 7), Upsert::Created(7));
        assert_eq!(insert_outcome(false, 7), Upsert::Updated(7));
        assert!(insert_outcome(false, 7).is_write());
    }
}
