//! `gpsno run`: the long-running sync service.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gpsno_api::TimeSeriesSink;
use gpsno_config::Config;
use gpsno_core::{Datastore, PgDatastore, SyncService};

use crate::commands::util;
use crate::error::CliError;

pub async fn handle(config: &Config) -> Result<(), CliError> {
    let cancel = CancellationToken::new();
    let pool = util::connect_pool(&config.database).await?;
    let store: Arc<dyn Datastore> = Arc::new(PgDatastore::new(pool.clone()));
    let capture = util::capture(config, &pool, cancel.child_token()).await?;
    let sink = util::start_sink(config, cancel.child_token()).await?;
    let (mqtt, bus) = util::start_bus(config, cancel.child_token());

    let service = SyncService::new(
        config.sync_config()?,
        store,
        bus,
        capture,
        sink.clone().map(|sink| sink as Arc<dyn TimeSeriesSink>),
    );

    let result = match service.start().await {
        Ok(()) => tokio::select! {
            result = service.wait() => result.map_err(CliError::from),
            () = shutdown_signal() => {
                info!("shutdown requested");
                Ok(())
            }
        },
        Err(e) => Err(e.into()),
    };

    service.shutdown().await;
    mqtt.shutdown().await;
    if let Some(sink) = sink {
        sink.close().await;
    }
    cancel.cancel();
    pool.close().await;
    info!("stopped");
    result
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
