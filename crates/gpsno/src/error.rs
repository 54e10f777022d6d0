//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a process exit code.

use miette::Diagnostic;
use thiserror::Error;

use gpsno_config::ConfigError;
use gpsno_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
    pub const CAPTURE_LOST: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not connect to the database at {target}")]
    #[diagnostic(
        code(gpsno::database_unreachable),
        help(
            "Check [database] host, port and credentials.\n\
             Inspect the resolved settings with: gpsno config show"
        )
    )]
    DatabaseUnreachable {
        target: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("MQTT broker at {target} did not accept a connection within {seconds}s")]
    #[diagnostic(
        code(gpsno::broker_unreachable),
        help("Check [bus] host and port, and that the broker is running.")
    )]
    BrokerUnreachable { target: String, seconds: u64 },

    #[error("{message}")]
    #[diagnostic(code(gpsno::transport))]
    Transport { message: String },

    #[error("Change capture stopped: {message}")]
    #[diagnostic(
        code(gpsno::capture_lost),
        help("The listening database connection was lost. Restart the service.")
    )]
    CaptureLost { message: String },

    // ── Sync ─────────────────────────────────────────────────────────

    #[error("{failed} of {total} publishes failed")]
    #[diagnostic(
        code(gpsno::partial_sync),
        help("Failed entities are logged with their topic; rerun with -v for details.")
    )]
    PartialSync { failed: usize, total: usize },

    #[error("{operation} timed out after {timeout_ms}ms")]
    #[diagnostic(code(gpsno::timeout))]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(gpsno::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error(transparent)]
    #[diagnostic(
        code(gpsno::config),
        help(
            "Settings come from the config file, then GPSNO_<SECTION>__<KEY>\n\
             environment variables. Find the file with: gpsno config path"
        )
    )]
    Config(#[from] ConfigError),

    #[error("Logging setup failed: {reason}")]
    #[diagnostic(code(gpsno::logging))]
    Logging { reason: String },

    // ── Everything else ──────────────────────────────────────────────

    #[error("{message}")]
    #[diagnostic(code(gpsno::internal))]
    Internal { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DatabaseUnreachable { .. }
            | Self::BrokerUnreachable { .. }
            | Self::Transport { .. } => exit_code::CONNECTION,
            Self::CaptureLost { .. } => exit_code::CAPTURE_LOST,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Config(_) | Self::Logging { .. } => exit_code::CONFIG,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "input".into(),
                reason: message,
            },

            CoreError::Transport { message } | CoreError::Database { message } => {
                CliError::Transport { message }
            }

            CoreError::CaptureLost { message } => CliError::CaptureLost { message },

            CoreError::Timeout {
                operation,
                timeout_ms,
            } => CliError::Timeout {
                operation,
                timeout_ms,
            },

            CoreError::Config { message } => CliError::Config(ConfigError::Validation {
                field: "runtime".into(),
                reason: message,
            }),

            other @ (CoreError::ReferenceNotFound { .. }
            | CoreError::ParseFailed { .. }
            | CoreError::Internal(_)) => CliError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<gpsno_api::Error> for CliError {
    fn from(err: gpsno_api::Error) -> Self {
        CoreError::from(err).into()
    }
}
