//! Tracing setup: stderr in the configured format, plus an optional
//! daily-rolling log file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gpsno_config::{LogFormat, LoggingSettings};

use crate::cli::GlobalOpts;
use crate::error::CliError;

const LOG_FILE_PREFIX: &str = "gpsno.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must live as long as the process logs.
pub fn init(
    settings: &LoggingSettings,
    global: &GlobalOpts,
) -> Result<Option<WorkerGuard>, CliError> {
    let directive = match global.verbose {
        0 => settings.level.clone(),
        1 => "info".into(),
        2 => "debug".into(),
        _ => "trace".into(),
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&directive).map_err(|e| CliError::Logging {
            reason: format!("invalid level '{directive}': {e}"),
        })?,
    };

    let format = global.log_format.unwrap_or(settings.format);
    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(format)];

    let guard = match settings.directory {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| CliError::Logging {
            reason: e.to_string(),
        })?;
    Ok(guard)
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    }
}
