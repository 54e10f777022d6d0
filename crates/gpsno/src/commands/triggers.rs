//! `gpsno install-triggers`

use gpsno_api::TriggerInstaller;
use gpsno_api::capture::PgTriggerInstaller;
use gpsno_config::Config;
use gpsno_core::store::{CLUSTERS_TABLE, STATIONS_TABLE};

use crate::cli::GlobalOpts;
use crate::commands::util;
use crate::error::CliError;
use crate::output;

pub async fn handle(config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let pool = util::connect_pool(&config.database).await?;
    let installer = PgTriggerInstaller::new(pool.clone());
    let channel = &config.database.channel;

    let result = install(&installer, channel).await;
    pool.close().await;
    result?;

    output::print_output(
        &format!("Installed notify function on '{channel}' and triggers on {STATIONS_TABLE}, {CLUSTERS_TABLE}"),
        global.quiet,
    );
    Ok(())
}

async fn install(installer: &PgTriggerInstaller, channel: &str) -> Result<(), CliError> {
    installer.install_function(channel).await?;
    for table in [STATIONS_TABLE, CLUSTERS_TABLE] {
        installer.install_trigger(table).await?;
    }
    Ok(())
}
