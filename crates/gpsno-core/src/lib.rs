//! Reconciliation engine between the station database and the MQTT bus.
//!
//! Built on the wire-level pieces in `gpsno-api`:
//!
//! - **[`SyncService`]**: lifecycle facade. [`start()`](SyncService::start)
//!   registers the reconcilers on both sides, starts change capture,
//!   subscribes the topic filters and publishes a baseline;
//!   [`wait()`](SyncService::wait) surfaces a fatal capture failure.
//!
//! - **Reconcilers** ([`reconcile`]): one per entity kind, handling
//!   DB→bus (row-change events) and bus→DB (inbound envelopes) with the
//!   `"SYNC"` tag as the loop breaker.
//!
//! - **[`Datastore`]**: create-or-update and snapshot queries over
//!   Postgres ([`PgDatastore`]). The `testing` feature adds an in-memory
//!   implementation.
//!
//! - **Measurements** ([`measurement`]): validated readings turned into
//!   time-series points.
//!
//! - **Domain model** ([`model`]): `Station`, `Cluster`, their wire DTOs,
//!   and the canonical [`MacAddress`].

pub mod config;
pub mod error;
pub mod measurement;
pub mod model;
pub mod reconcile;
pub mod service;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::SyncConfig;
pub use error::CoreError;
pub use measurement::{Measurement, MeasurementHandler};
pub use model::{
    Cluster, ClusterDto, ClusterSnapshot, MacAddress, Station, StationConfig, StationDto,
    UwbConfig, UwbMode,
};
pub use reconcile::{ClusterReconciler, DropReason, Outcome, StationReconciler, SyncReport};
pub use service::{BusLink, Reconcilers, ServiceState, SyncScope, SyncService};
pub use store::{Datastore, PgDatastore, Upsert};
#[cfg(any(test, feature = "testing"))]
pub use store::MemoryDatastore;
