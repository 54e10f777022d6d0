//! Reconciliation between the datastore and the bus.
//!
//! One reconciler per entity kind. Each handles both directions:
//!
//! - **DB→bus**: a row-change event is decoded, normalized, persisted again
//!   if normalization changed it, and otherwise published retained with the
//!   `"SYNC"` tag (or cleared, for deletes).
//! - **Bus→DB**: an inbound envelope is dropped when it carries our own
//!   `"SYNC"` tag, turned into a full resync when it does not parse, and
//!   otherwise merged into the store. The stored state is then published
//!   back unless nothing changed.
//!
//! Loops terminate because every message this service publishes is tagged
//! `"SYNC"`, and because a write that changes nothing never reaches the
//! database (and so never fires the trigger).

pub mod cluster;
pub mod station;

use std::fmt;

pub use cluster::ClusterReconciler;
pub use station::StationReconciler;

/// What a reconciler did with one event or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stored state published to its authoritative address.
    Published,
    /// A deleted entity's retained message was cleared.
    Cleared,
    /// The normalized form was written back; the resulting change event
    /// publishes it.
    Normalized,
    /// External intent created a new entity.
    Created,
    /// External intent changed a stored entity.
    Updated,
    /// External intent matched stored state; nothing written or published.
    Converged,
    /// A malformed inbound message triggered a full resync.
    Resynced,
    /// Points handed to the time-series sink.
    Recorded(usize),
    Dropped(DropReason),
}

/// Why a message was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Our own publication coming back.
    Echo,
    /// An empty payload, i.e. a retained-message clear.
    Empty,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Published => f.write_str("published"),
            Self::Cleared => f.write_str("cleared"),
            Self::Normalized => f.write_str("normalized"),
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
            Self::Converged => f.write_str("converged"),
            Self::Resynced => f.write_str("resynced"),
            Self::Recorded(n) => write!(f, "recorded {n} points"),
            Self::Dropped(DropReason::Echo) => f.write_str("dropped echo"),
            Self::Dropped(DropReason::Empty) => f.write_str("dropped empty payload"),
        }
    }
}

/// Tally of one full resync. Individual failures never abort the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub published: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.published + self.failed
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

impl std::ops::Add for SyncReport {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            published: self.published + rhs.published,
            failed: self.failed + rhs.failed,
        }
    }
}
