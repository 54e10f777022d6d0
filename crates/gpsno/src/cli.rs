//! Clap derive structures for the `gpsno` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use gpsno_config::LogFormat;
use gpsno_core::SyncScope;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// gpsno -- keeps the station database and the MQTT bus in agreement
#[derive(Debug, Parser)]
#[command(
    name = "gpsno",
    version,
    about = "Sync GPS:No stations and clusters between Postgres and MQTT",
    long_about = "Bidirectional reconciliation between the station database and the\n\
        MQTT message bus.\n\n\
        Row changes are published as retained messages under {base}/v1/...;\n\
        inbound messages are validated, normalized and written back.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "GPSNO_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv); RUST_LOG takes precedence
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format (overrides [logging] format)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sync service until interrupted
    Run,

    /// Publish every active entity once, then exit
    Sync(SyncArgs),

    /// Install the change-notification function and table triggers
    InstallTriggers,

    /// Inspect the resolved configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Which entity kinds to publish
    #[arg(value_enum, default_value = "all")]
    pub scope: SyncTarget,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SyncTarget {
    Stations,
    Clusters,
    All,
}

impl From<SyncTarget> for SyncScope {
    fn from(target: SyncTarget) -> Self {
        match target {
            SyncTarget::Stations => Self::Stations,
            SyncTarget::Clusters => Self::Clusters,
            SyncTarget::All => Self::All,
        }
    }
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the resolved configuration with secrets redacted
    Show,

    /// Print the config file location
    Path,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
