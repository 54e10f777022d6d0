//! `gpsno sync [stations|clusters|all]`: one-shot full resync.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use gpsno_api::{Publisher, TopicSpace};
use gpsno_config::Config;
use gpsno_core::{PgDatastore, Reconcilers, SyncReport, SyncScope};

use crate::cli::{GlobalOpts, SyncArgs};
use crate::commands::util;
use crate::error::CliError;
use crate::output;

pub async fn handle(config: &Config, args: &SyncArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let sync = config.sync_config()?;
    let pool = util::connect_pool(&config.database).await?;
    let cancel = CancellationToken::new();
    let (mqtt, mut bus) = util::start_bus(config, cancel.clone());

    let result = match util::wait_connected(config, &mut bus).await {
        Ok(()) => {
            let reconcilers = Reconcilers::new(
                Arc::new(PgDatastore::new(pool.clone())),
                Publisher::new(bus.transport.clone(), sync.qos, sync.publish_timeout),
                Arc::new(TopicSpace::new(sync.base_topic.clone())),
            );
            publish(&reconcilers, args.scope.into()).await
        }
        Err(e) => Err(e),
    };

    mqtt.shutdown().await;
    cancel.cancel();
    pool.close().await;
    let rows = result?;

    let color = output::should_color(&global.color);
    output::print_output(&output::render_report(&rows, color), global.quiet);

    let total = rows
        .iter()
        .fold(SyncReport::default(), |acc, (_, report)| acc + *report);
    info!(published = total.published, failed = total.failed, "sync finished");
    if total.is_clean() {
        Ok(())
    } else {
        Err(CliError::PartialSync {
            failed: total.failed,
            total: total.total(),
        })
    }
}

async fn publish(
    reconcilers: &Reconcilers,
    scope: SyncScope,
) -> Result<Vec<(&'static str, SyncReport)>, CliError> {
    let mut rows = Vec::new();
    if matches!(scope, SyncScope::Stations | SyncScope::All) {
        rows.push(("stations", reconcilers.stations.sync_all().await?));
    }
    if matches!(scope, SyncScope::Clusters | SyncScope::All) {
        rows.push(("clusters", reconcilers.clusters.sync_all().await?));
    }
    Ok(rows)
}
