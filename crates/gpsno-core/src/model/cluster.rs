// ── Cluster ──
//
// A named group of stations. Membership lives on the station side
// (`stations.cluster_id`) and is only ever read as a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::nullable;
use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub description: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Name and description trimmed. A cluster without a name is invalid.
    pub fn normalized(&self) -> Result<Self, CoreError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("cluster name is required"));
        }
        Ok(Self {
            name: name.to_owned(),
            description: self.description.trim().to_owned(),
            ..self.clone()
        })
    }

    /// Apply external intent; the identity (`name`) and key stay as stored.
    /// Applying intent revives a soft-deleted cluster.
    pub fn merged_with(&self, incoming: &Cluster) -> Self {
        Self {
            description: incoming.description.clone(),
            deleted_at: None,
            ..self.clone()
        }
    }

    /// Compares the persisted settings, ignoring keys and timestamps.
    pub fn same_settings(&self, other: &Self) -> bool {
        self.name == other.name && self.description == other.description
    }
}

/// A cluster together with the addresses of its non-deleted members,
/// read in one go from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub cluster: Cluster,
    /// Canonical member addresses, sorted.
    pub stations: Vec<String>,
}

impl ClusterSnapshot {
    pub fn to_dto(&self) -> ClusterDto {
        ClusterDto {
            id: self.cluster.id,
            name: self.cluster.name.clone(),
            description: self.cluster.description.clone(),
            stations: self.stations.clone(),
        }
    }
}

// ── Wire projection ──────────────────────────────────────────────────

/// What a cluster looks like on the bus. `stations` is informational and
/// ignored on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDto {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub description: String,
    #[serde(default, deserialize_with = "nullable")]
    pub stations: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalization_trims_and_requires_a_name() {
        let cluster = Cluster {
            description: " hall ".into(),
            ..Cluster::new("  north ")
        }
        .normalized()
        .unwrap();
        assert_eq!(cluster.name, "north");
        assert_eq!(cluster.description, "hall");
        assert_eq!(cluster.normalized().unwrap(), cluster);

        assert!(matches!(
            Cluster::new("   ").normalized(),
            Err(CoreError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn snapshot_projects_members() {
        let snapshot = ClusterSnapshot {
            cluster: Cluster {
                id: 2,
                ..Cluster::new("north")
            },
            stations: vec!["aa:bb:cc:dd:ee:ff".into()],
        };
        assert_eq!(
            serde_json::to_value(snapshot.to_dto()).unwrap(),
            json!({
                "id": 2,
                "name": "north",
                "description": "",
                "stations": ["aa:bb:cc:dd:ee:ff"]
            })
        );
    }

    #[test]
    fn merge_revives_and_keeps_identity() {
        let stored = Cluster {
            id: 5,
            deleted_at: Some(Utc::now()),
            ..Cluster::new("north")
        };
        let incoming = Cluster {
            description: "hall".into(),
            ..Cluster::new("north")
        };

        let merged = stored.merged_with(&incoming);
        assert_eq!(merged.id, 5);
        assert!(!merged.is_deleted());
        assert!(merged.same_settings(&incoming));
        assert!(!stored.same_settings(&incoming));
    }
}
