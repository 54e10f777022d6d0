// ── In-memory datastore ──
//
// Lock-free tables keyed by surrogate id, with a `watch`-backed write
// counter so tests can both count and await writes. A single async mutex
// stands in for the database transaction around each upsert.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, watch};

use super::{Datastore, Upsert, cluster_settings_differ, station_settings_differ};
use crate::error::CoreError;
use crate::model::{Cluster, ClusterSnapshot, MacAddress, Station};

/// One table: id -> row.
struct Table<T: Clone + Send + Sync + 'static> {
    rows: DashMap<i64, Arc<T>>,
}

impl<T: Clone + Send + Sync + 'static> Table<T> {
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    fn get(&self, id: i64) -> Option<T> {
        self.rows.get(&id).map(|r| T::clone(r.value()))
    }

    fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.rows
            .iter()
            .find(|r| pred(r.value()))
            .map(|r| T::clone(r.value()))
    }

    fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| T::clone(r.value()))
            .collect()
    }

    fn put(&self, id: i64, row: T) {
        self.rows.insert(id, Arc::new(row));
    }
}

/// Datastore backed by process memory.
pub struct MemoryDatastore {
    stations: Table<Station>,
    clusters: Table<Cluster>,
    next_id: AtomicI64,
    /// Serializes read-check-write like a row lock would.
    tx: Mutex<()>,
    /// Bumped on every write through the `Datastore` trait.
    writes: watch::Sender<u64>,
    /// Every `Datastore` call, reads included.
    calls: AtomicUsize,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatastore {
    pub fn new() -> Self {
        let (writes, _) = watch::channel(0u64);
        Self {
            stations: Table::new(),
            clusters: Table::new(),
            next_id: AtomicI64::new(1),
            tx: Mutex::new(()),
            writes,
            calls: AtomicUsize::new(0),
        }
    }

    // ── Seeding / inspection (not counted) ───────────────────────────

    /// Store `station` as-is, assigning an id if it has none.
    pub fn insert_station(&self, mut station: Station) -> Station {
        if station.id == 0 {
            station.id = self.allocate_id();
        }
        self.stations.put(station.id, station.clone());
        station
    }

    /// Store `cluster` as-is, assigning an id if it has none.
    pub fn insert_cluster(&self, mut cluster: Cluster) -> Cluster {
        if cluster.id == 0 {
            cluster.id = self.allocate_id();
        }
        self.clusters.put(cluster.id, cluster.clone());
        cluster
    }

    pub fn station(&self, mac: &str) -> Option<Station> {
        self.stations.find(|s| s.mac_address == mac)
    }

    pub fn cluster(&self, id: i64) -> Option<Cluster> {
        self.clusters.get(id)
    }

    /// Number of writes made through the `Datastore` trait.
    pub fn writes(&self) -> u64 {
        *self.writes.borrow()
    }

    pub fn subscribe_writes(&self) -> watch::Receiver<u64> {
        self.writes.subscribe()
    }

    /// Number of `Datastore` calls, reads included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn bump_writes(&self) {
        self.writes.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn find_station(&self, mac: &MacAddress) -> Result<Option<Station>, CoreError> {
        self.touch();
        Ok(self.station(mac.as_str()))
    }

    async fn upsert_station(&self, station: &Station) -> Result<Upsert<Station>, CoreError> {
        self.touch();
        let _tx = self.tx.lock().await;

        let existing = if station.id > 0 {
            self.stations.get(station.id)
        } else {
            self.station(&station.mac_address)
        };

        let now = Some(Utc::now());
        let result = match existing {
            Some(stored) if !station_settings_differ(&stored, station) => {
                return Ok(Upsert::Unchanged(stored));
            }
            Some(stored) => {
                let row = Station {
                    id: stored.id,
                    created_at: stored.created_at,
                    updated_at: now,
                    ..station.clone()
                };
                self.stations.put(row.id, row.clone());
                Upsert::Updated(row)
            }
            None => {
                let row = Station {
                    id: self.allocate_id(),
                    created_at: station.created_at.or(now),
                    updated_at: now,
                    ..station.clone()
                };
                self.stations.put(row.id, row.clone());
                Upsert::Created(row)
            }
        };

        self.bump_writes();
        Ok(result)
    }

    async fn active_stations(&self) -> Result<Vec<Station>, CoreError> {
        self.touch();
        let mut stations = self.stations.filter(|s| !s.is_deleted());
        stations.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        Ok(stations)
    }

    async fn find_cluster(&self, id: i64) -> Result<Option<Cluster>, CoreError> {
        self.touch();
        Ok(self.clusters.get(id))
    }

    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, CoreError> {
        self.touch();
        Ok(self.clusters.find(|c| c.name == name))
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<Upsert<Cluster>, CoreError> {
        self.touch();
        let _tx = self.tx.lock().await;

        let existing = if cluster.id > 0 {
            self.clusters.get(cluster.id)
        } else {
            self.clusters.find(|c| c.name == cluster.name)
        };

        let now = Some(Utc::now());
        let result = match existing {
            Some(stored) if !cluster_settings_differ(&stored, cluster) => {
                return Ok(Upsert::Unchanged(stored));
            }
            Some(stored) => {
                let row = Cluster {
                    id: stored.id,
                    created_at: stored.created_at,
                    updated_at: now,
                    ..cluster.clone()
                };
                self.clusters.put(row.id, row.clone());
                Upsert::Updated(row)
            }
            None => {
                let row = Cluster {
                    id: self.allocate_id(),
                    created_at: cluster.created_at.or(now),
                    updated_at: now,
                    ..cluster.clone()
                };
                self.clusters.put(row.id, row.clone());
                Upsert::Created(row)
            }
        };

        self.bump_writes();
        Ok(result)
    }

    async fn cluster_members(&self, id: i64) -> Result<Vec<String>, CoreError> {
        self.touch();
        let mut members: Vec<String> = self
            .stations
            .filter(|s| !s.is_deleted() && s.cluster_id == Some(id))
            .into_iter()
            .map(|s| s.mac_address)
            .collect();
        members.sort();
        Ok(members)
    }

    async fn active_clusters(&self) -> Result<Vec<ClusterSnapshot>, CoreError> {
        let mut clusters = self.clusters.filter(|c| !c.is_deleted());
        clusters.sort_by_key(|c| c.id);

        let mut snapshots = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let stations = self.cluster_members(cluster.id).await?;
            snapshots.push(ClusterSnapshot { cluster, stations });
        }
        self.touch();
        Ok(snapshots)
    }
}
