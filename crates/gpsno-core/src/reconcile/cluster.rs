// ── Cluster reconciler ──
//
// Clusters are addressed on the bus by their numeric key
// (`{base}/v1/clusters/{id}`) and identified by name. The published
// snapshot embeds the member list, which is always read from the store.

use std::sync::Arc;

use async_trait::async_trait;
use gpsno_api::{
    BoxError, BusMessage, Change, MessageHandler, Publisher, TableChangeEvent, TableListener,
    TopicSpace,
};
use tracing::{debug, info, warn};

use super::{DropReason, Outcome, SyncReport};
use crate::error::CoreError;
use crate::model::{Cluster, ClusterDto, ClusterSnapshot};
use crate::store::{Datastore, Upsert};

pub struct ClusterReconciler {
    store: Arc<dyn Datastore>,
    publisher: Publisher,
    topics: Arc<TopicSpace>,
}

impl ClusterReconciler {
    pub fn new(store: Arc<dyn Datastore>, publisher: Publisher, topics: Arc<TopicSpace>) -> Self {
        Self {
            store,
            publisher,
            topics,
        }
    }

    fn address(&self, id: i64) -> Result<String, CoreError> {
        Ok(self.topics.cluster_topic(&id.to_string())?)
    }

    // ── DB→bus ───────────────────────────────────────────────────────

    pub async fn on_table_change(&self, event: &TableChangeEvent) -> Result<Outcome, CoreError> {
        let cluster = match event.decode::<Cluster>()? {
            Change::Delete { mut before } => {
                before.deleted_at.get_or_insert(event.timestamp);
                before
            }
            change => change.into_row(),
        };

        if cluster.is_deleted() {
            let address = self.address(cluster.id)?;
            self.publisher.clear_retained(&address).await?;
            info!(cluster = %cluster.name, topic = %address, "cluster deleted, cleared retained state");
            return Ok(Outcome::Cleared);
        }

        let normalized = cluster.normalized()?;
        if !normalized.same_settings(&cluster) {
            self.store.upsert_cluster(&normalized).await?;
            debug!(cluster = %normalized.name, "persisted normalized cluster");
            return Ok(Outcome::Normalized);
        }

        let stations = self.store.cluster_members(normalized.id).await?;
        self.publish(&ClusterSnapshot {
            cluster: normalized,
            stations,
        })
        .await?;
        Ok(Outcome::Published)
    }

    /// Publish one snapshot to the cluster's address, tagged `"SYNC"`.
    pub async fn publish(&self, snapshot: &ClusterSnapshot) -> Result<(), CoreError> {
        let address = self.address(snapshot.cluster.id)?;
        self.publisher
            .publish_entity(&address, &snapshot.to_dto())
            .await?;
        Ok(())
    }

    /// Publish every non-deleted cluster with its current members.
    pub async fn sync_all(&self) -> Result<SyncReport, CoreError> {
        let snapshots = self.store.active_clusters().await?;
        let mut report = SyncReport::default();

        for snapshot in &snapshots {
            match self.publish(snapshot).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(cluster = %snapshot.cluster.name, error = %e, "failed to publish cluster");
                }
            }
        }

        debug!(
            published = report.published,
            failed = report.failed,
            "cluster resync finished"
        );
        Ok(report)
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

        let wire = match message.decode::<ClusterDto>() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "unparseable cluster message, resyncing all clusters");
                self.sync_all().await?;
                return Ok(Outcome::Resynced);
            }
        };

        match self.apply(&message.topic, &wire.data).await {
            Err(e @ CoreError::ValidationFailed { .. }) => {
                warn!(topic = %message.topic, error = %e, "rejected cluster message");
                self.clear(&message.topic).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn apply(&self, inbound: &str, dto: &ClusterDto) -> Result<Outcome, CoreError> {
        let incoming = Cluster {
            description: dto.description.clone(),
            ..Cluster::new(dto.name.clone())
        }
        .normalized()?;

        let candidate = match self.store.find_cluster_by_name(&incoming.name).await? {
            Some(stored) if !stored.is_deleted() && stored.same_settings(&incoming) => {
                debug!(cluster = %stored.name, "cluster already converged");
                self.clear_if_foreign(inbound, stored.id).await;
                return Ok(Outcome::Converged);
            }
            Some(stored) => stored.merged_with(&incoming),
            None => incoming,
        };

        let (outcome, cluster) = match self.store.upsert_cluster(&candidate).await? {
            Upsert::Created(c) => (Outcome::Created, c),
            Upsert::Updated(c) => (Outcome::Updated, c),
            Upsert::Unchanged(c) => (Outcome::Converged, c),
        };
        info!(cluster = %cluster.name, id = cluster.id, %outcome, "applied cluster message");

        if outcome != Outcome::Converged {
            let stations = self.store.cluster_members(cluster.id).await?;
            let snapshot = ClusterSnapshot {
                cluster: cluster.clone(),
                stations,
            };
            if let Err(e) = self.publish(&snapshot).await {
                warn!(cluster = %cluster.name, error = %e, "failed to publish cluster");
            }
        }
        self.clear_if_foreign(inbound, cluster.id).await;
        Ok(outcome)
    }

    /// Clear `inbound` when it is not the cluster's own address.
    async fn clear_if_foreign(&self, inbound: &str, id: i64) {
        match self.address(id) {
            Ok(address) if address == inbound => {}
            _ => self.clear(inbound).await,
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
impl TableListener for ClusterReconciler {
    fn name(&self) -> &str {
        "cluster-reconciler"
    }

    async fn on_change(&self, event: &TableChangeEvent) -> Result<(), BoxError> {
        let outcome = self.on_table_change(event).await?;
        debug!(table = %event.table, operation = %event.operation, %outcome, "cluster change reconciled");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ClusterReconciler {
    async fn handle(&self, message: BusMessage) -> Result<(), BoxError> {
        let outcome = self.on_message(&message).await?;
        debug!(topic = %message.topic, %outcome, "cluster message reconciled");
        Ok(())
    }
}
