//! Command dispatch: each subcommand builds the connections it needs.

pub mod config_cmd;
pub mod run;
pub mod sync;
pub mod triggers;
pub mod util;

use gpsno_config::Config;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a command that needs the loaded configuration.
pub async fn dispatch(cmd: Command, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Run => run::handle(config).await,
        Command::Sync(args) => sync::handle(config, &args, global).await,
        Command::InstallTriggers => triggers::handle(config, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => Ok(()),
    }
}
