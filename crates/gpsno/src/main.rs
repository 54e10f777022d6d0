//! `gpsno` -- runs the station/cluster sync service and its one-shot
//! maintenance commands.

mod cli;
mod commands;
mod error;
mod logging;
mod output;

use clap::Parser;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Dispatch and handle errors with proper exit codes
    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands only read the configuration
        Command::Config(ref args) => commands::config_cmd::handle(args, &cli.global),

        Command::Completions(ref args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "gpsno", &mut std::io::stdout());
            Ok(())
        }

        cmd => {
            let config = gpsno_config::load_config(cli.global.config.as_deref())?;
            let _guard = logging::init(&config.logging, &cli.global)?;

            tracing::debug!(command = ?cmd, "dispatching command");
            commands::dispatch(cmd, &config, &cli.global).await
        }
    }
}
