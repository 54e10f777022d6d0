// ── Station reconciler ──
//
// Stations are addressed by their `topic` segment
// (`{base}/v1/stations/aabbccddeeff` by default) and identified by their
// canonical hardware address.

use std::sync::Arc;

use async_trait::async_trait;
use gpsno_api::{
    BoxError, BusMessage, Change, MessageHandler, Publisher, TableChangeEvent, TableListener,
    TopicSpace,
};
use tracing::{debug, info, warn};

use super::{ClusterReconciler, DropReason, Outcome, SyncReport};
use crate::error::CoreError;
use crate::model::{MacAddress, Station, StationDto};
use crate::store::{Datastore, Upsert};

pub struct StationReconciler {
    store: Arc<dyn Datastore>,
    publisher: Publisher,
    topics: Arc<TopicSpace>,
    clusters: Arc<ClusterReconciler>,
}

impl StationReconciler {
    pub fn new(
        store: Arc<dyn Datastore>,
        publisher: Publisher,
        topics: Arc<TopicSpace>,
        clusters: Arc<ClusterReconciler>,
    ) -> Self {
        Self {
            store,
            publisher,
            topics,
            clusters,
        }
    }

    fn address(&self, station: &Station) -> Result<String, CoreError> {
        Ok(self.topics.station_topic(&station.topic)?)
    }

    // ── DB→bus ───────────────────────────────────────────────────────

    pub async fn on_table_change(&self, event: &TableChangeEvent) -> Result<Outcome, CoreError> {
        let (station, previous) = match event.decode::<Station>()? {
            Change::Delete { mut before } => {
                before.deleted_at.get_or_insert(event.timestamp);
                (before, None)
            }
            Change::Update { before, after } => (after, before),
            Change::Insert { after } => (after, None),
        };

        let normalized = station.normalized()?;
        let outcome = if station.is_deleted() {
            let address = self.address(&normalized)?;
            self.publisher.clear_retained(&address).await?;
            info!(mac = %normalized.mac_address, topic = %address, "station deleted, cleared retained state");
            Outcome::Cleared
        } else if normalized.to_dto() != station.to_dto() {
            self.store.upsert_station(&normalized).await?;
            debug!(mac = %normalized.mac_address, "persisted normalized station");
            // The follow-up UPDATE no longer carries the old topic.
            if let Some(previous) = previous {
                self.clear_renamed(&previous, &normalized).await;
            }
            return Ok(Outcome::Normalized);
        } else {
            self.publish_normalized(&normalized).await?;
            Outcome::Published
        };

        if let Some(previous) = previous {
            self.clear_renamed(&previous, &normalized).await;
        }

        // Every cluster snapshot embeds its member list.
        self.resync_clusters().await;
        Ok(outcome)
    }

    /// Clear the old address when a row update moved the station's topic.
    async fn clear_renamed(&self, previous: &Station, current: &Station) {
        let Ok(previous) = previous.normalized() else {
            return;
        };
        if previous.topic == current.topic {
            return;
        }
        if let Ok(old) = self.address(&previous) {
            debug!(mac = %current.mac_address, topic = %old, "station topic renamed, clearing old address");
            self.clear(&old).await;
        }
    }

    /// Publish one station's normalized projection, tagged `"SYNC"`.
    pub async fn publish(&self, station: &Station) -> Result<(), CoreError> {
        self.publish_normalized(&station.normalized()?).await
    }

    async fn publish_normalized(&self, station: &Station) -> Result<(), CoreError> {
        let address = self.address(station)?;
        self.publisher
            .publish_entity(&address, &station.to_dto())
            .await?;
        Ok(())
    }

    /// Publish every non-deleted station.
    pub async fn sync_all(&self) -> Result<SyncReport, CoreError> {
        let stations = self.store.active_stations().await?;
        let mut report = SyncReport::default();

        for station in &stations {
            match self.publish(station).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(mac = %station.mac_address, error = %e, "failed to publish station");
                }
            }
        }

        debug!(
            published = report.published,
            failed = report.failed,
            "station resync finished"
        );
        Ok(report)
    }

    async fn resync_clusters(&self) {
        match self.clusters.sync_all().await {
            Ok(report) if !report.is_clean() => {
                warn!(failed = report.failed, "cluster resync after station change was partial");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cluster resync after station change failed"),
        }
    }

    // ── Bus→DB ───────────────────────────────────────────────────────

    pub async fn on_message(&self, message: &BusMessage) -> Result<Outcome, CoreError> {
        if message.is_empty() {
            return Ok(Outcome::Dropped(DropReason::Empty));
        }
        // Checked before the entity decode so a malformed echo never resyncs.
        if message.is_echo() {
            return Ok(Outcome::Dropped(DropReason::Echo));
        }

        let wire = match message.decode::<StationDto>() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "unparseable station message, resyncing all stations");
                self.sync_all().await?;
                return Ok(Outcome::Resynced);
            }
        };

        match self.apply(&message.topic, wire.data).await {
            Err(e @ CoreError::ValidationFailed { .. }) => {
                warn!(topic = %message.topic, error = %e, "rejected station message");
                self.clear(&message.topic).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn apply(&self, inbound: &str, dto: StationDto) -> Result<Outcome, CoreError> {
        let mac = MacAddress::parse(&dto.mac_address)?;
        let cluster_id = self.resolve_cluster(dto.cluster_id, &mac).await?;
        let dto = StationDto {
            mac_address: mac.to_string(),
            cluster_id,
            ..dto
        };

        let stored = self.store.find_station(&mac).await?;
        let candidate = match &stored {
            Some(stored) => stored.merged_with(&dto),
            None => Station::from_dto(&dto),
        }
        .normalized()?;
        let address = self.address(&candidate)?;

        if let Some(stored) = &stored {
            if !stored.is_deleted() && stored.to_dto() == candidate.to_dto() {
                debug!(mac = %mac, "station already converged");
                self.clear_if_foreign(inbound, &address).await;
                return Ok(Outcome::Converged);
            }
        }

        let (outcome, station) = match self.store.upsert_station(&candidate).await? {
            Upsert::Created(s) => (Outcome::Created, s),
            Upsert::Updated(s) => (Outcome::Updated, s),
            Upsert::Unchanged(s) => (Outcome::Converged, s),
        };
        info!(mac = %mac, topic = %address, %outcome, "applied station message");

        if outcome != Outcome::Converged {
            if let Err(e) = self.publish_normalized(&station).await {
                warn!(mac = %mac, error = %e, "failed to publish station");
            }
        }

        // A renamed topic leaves the old retained state behind.
        if let Some(previous) = stored.as_ref().filter(|s| s.topic != station.topic) {
            if let Ok(old) = self.address(previous) {
                self.clear(&old).await;
            }
        }
        self.clear_if_foreign(inbound, &address).await;
        Ok(outcome)
    }

    /// Resolve a cluster reference; a missing or deleted cluster degrades
    /// to "unclustered" instead of failing.
    async fn resolve_cluster(
        &self,
        cluster_id: Option<i64>,
        mac: &MacAddress,
    ) -> Result<Option<i64>, CoreError> {
        let Some(id) = cluster_id.filter(|id| *id > 0) else {
            return Ok(None);
        };

        match self.store.find_cluster(id).await? {
            Some(cluster) if !cluster.is_deleted() => Ok(Some(id)),
            _ => {
                let err = CoreError::ReferenceNotFound {
                    entity_type: "Cluster",
                    identifier: id.to_string(),
                };
                warn!(mac = %mac, error = %err, "clearing dangling cluster reference");
                Ok(None)
            }
        }
    }

    async fn clear_if_foreign(&self, inbound: &str, address: &str) {
        if inbound != address {
            self.clear(inbound).await;
        }
    }

    async fn clear(&self, topic: &str) {
        if let Err(e) = self.publisher.clear_retained(topic).await {
            warn!(topic, error = %e, "failed to clear retained message");
        }
    }
}

// ── Listener / handler adapters ──────────────────────────────────────

#[async_trait]
impl TableListener for StationReconciler {
    fn name(&self) -> &str {
        "station-reconciler"
    }

    async fn on_change(&self, event: &TableChangeEvent) -> Result<(), BoxError> {
        let outcome = self.on_table_change(event).await?;
        debug!(table = %event.table, operation = %event.operation, %outcome, "station change reconciled");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for StationReconciler {
    async fn handle(&self, message: BusMessage) -> Result<(), BoxError> {
        let outcome = self.on_message(&message).await?;
        debug!(topic = %message.topic, %outcome, "station message reconciled");
        Ok(())
    }
}
