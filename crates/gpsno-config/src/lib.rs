//! Configuration for the gpsno sync service.
//!
//! One TOML file with a section per concern, layered with figment:
//! built-in defaults, then the file, then `GPSNO_<SECTION>__<KEY>`
//! environment variables (`GPSNO_BUS__HOST`, `GPSNO_DATABASE__PASSWORD`).
//! The converters at the bottom turn each section into the runtime config
//! the `gpsno-api` / `gpsno-core` types expect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;

use gpsno_api::{BatchConfig, CaptureConfig, InfluxConfig, QoS};
use gpsno_api::bus::{MqttConfig, ReconnectConfig};
use gpsno_core::SyncConfig;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "GPSNO_";

/// Placeholder secrets serialize as.
pub const REDACTED: &str = "****";

const SSL_MODES: &[&str] = &[
    "disable",
    "allow",
    "prefer",
    "require",
    "verify-ca",
    "verify-full",
];

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration. Secrets serialize as [`REDACTED`], so a
/// serialized `Config` is safe to print but not to load back.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub capture: CaptureSettings,

    #[serde(default)]
    pub service: ServiceSettings,

    /// Measurement ingest is disabled without this section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influx: Option<InfluxSettings>,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// `[bus]`: the MQTT broker.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(
        serialize_with = "redact_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<SecretString>,
    /// Root of the topic tree.
    pub base_topic: String,
    /// 0, 1 or 2.
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub publish_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_secs: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "gpsno-sync".into(),
            username: None,
            password: None,
            base_topic: gpsno_core::config::DEFAULT_BASE_TOPIC.into(),
            qos: 1,
            keep_alive_secs: 30,
            clean_session: true,
            publish_timeout_secs: 5,
            reconnect_initial_ms: 1000,
            reconnect_max_secs: 30,
        }
    }
}

/// `[database]`: Postgres, for both queries and change capture.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(
        serialize_with = "redact_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<SecretString>,
    pub database: String,
    /// One of `disable`, `allow`, `prefer`, `require`, `verify-ca`,
    /// `verify-full`.
    pub ssl_mode: String,
    pub max_connections: u32,
    /// Notification channel the triggers publish on.
    pub channel: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: None,
            database: "gpsno".into(),
            ssl_mode: "prefer".into(),
            max_connections: 10,
            channel: gpsno_api::capture::DEFAULT_CHANNEL.into(),
        }
    }
}

/// `[capture]`: change-notification receive loop.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub dispatch_timeout_secs: u64,
    pub idle_probe_secs: u64,
    pub max_in_flight: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout_secs: 30,
            idle_probe_secs: 90,
            max_in_flight: 64,
        }
    }
}

/// `[service]`
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub handler_timeout_secs: u64,
    pub resync_on_start: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 30,
            resync_on_start: true,
        }
    }
}

/// `[influx]`: time-series sink for measurements.
#[derive(Debug, Deserialize, Serialize)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    #[serde(serialize_with = "redact")]
    pub token: SecretString,
    #[serde(default = "default_influx_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_influx_timeout() -> u64 {
    10
}
fn default_batch_size() -> usize {
    BatchConfig::default().batch_size
}
fn default_flush_interval() -> u64 {
    BatchConfig::default().flush_interval.as_secs()
}

/// Log line layout.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

/// `[logging]`
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Also write a daily-rotated log file here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

// ── Secret redaction ────────────────────────────────────────────────

fn redact<S: Serializer>(_secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(REDACTED)
}

#[allow(clippy::ref_option)]
fn redact_opt<S: Serializer>(
    secret: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(_) => serializer.serialize_some(REDACTED),
        None => serializer.serialize_none(),
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "gpsno", "gpsno").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("gpsno");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// The provider chain for `path`: defaults, file, environment.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate the configuration.
///
/// An explicit `path` must exist; the default location may be absent, in
/// which case defaults and environment alone apply.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(path) if !path.exists() => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Some(path) => path.to_path_buf(),
        None => config_path(),
    };

    let config: Config = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

// ── Validation ──────────────────────────────────────────────────────

impl Config {
    /// Check every section; the first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        self.database.validate()?;
        self.capture.validate()?;
        if let Some(ref influx) = self.influx {
            influx.validate()?;
        }
        if self.logging.level.trim().is_empty() {
            return Err(invalid("logging.level", "must not be empty"));
        }
        Ok(())
    }

    /// Printable TOML with secrets redacted.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl BusSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("bus.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("bus.port", "must be between 1 and 65535"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("bus.client_id", "must not be empty"));
        }
        self.qos()?;

        let base = &self.base_topic;
        if base.is_empty() || base.starts_with('/') || base.ends_with('/') {
            return Err(invalid(
                "bus.base_topic",
                format!("'{base}' must be non-empty without leading or trailing '/'"),
            ));
        }
        if base.contains(['+', '#']) {
            return Err(invalid(
                "bus.base_topic",
                format!("'{base}' must not contain wildcards"),
            ));
        }
        if self.publish_timeout_secs == 0 {
            return Err(invalid("bus.publish_timeout_secs", "must be positive"));
        }
        Ok(())
    }
}

impl DatabaseSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("database.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("database.port", "must be between 1 and 65535"));
        }
        if self.database.trim().is_empty() {
            return Err(invalid("database.database", "must not be empty"));
        }
        if !SSL_MODES.contains(&self.ssl_mode.as_str()) {
            return Err(invalid(
                "database.ssl_mode",
                format!("expected one of {}, got '{}'", SSL_MODES.join(", "), self.ssl_mode),
            ));
        }
        if self.max_connections == 0 {
            return Err(invalid("database.max_connections", "must be at least 1"));
        }
        gpsno_api::capture::validate_identifier(&self.channel)
            .map_err(|e| invalid("database.channel", e.to_string()))?;
        Ok(())
    }
}

impl CaptureSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch_timeout_secs == 0 {
            return Err(invalid("capture.dispatch_timeout_secs", "must be positive"));
        }
        if self.idle_probe_secs == 0 {
            return Err(invalid("capture.idle_probe_secs", "must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(invalid("capture.max_in_flight", "must be at least 1"));
        }
        Ok(())
    }
}

impl InfluxSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_url()?;
        if self.org.trim().is_empty() {
            return Err(invalid("influx.org", "must not be empty"));
        }
        if self.bucket.trim().is_empty() {
            return Err(invalid("influx.bucket", "must not be empty"));
        }
        if self.token.expose_secret().is_empty() {
            return Err(invalid("influx.token", "must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("influx.batch_size", "must be at least 1"));
        }
        Ok(())
    }

    fn parsed_url(&self) -> Result<url::Url, ConfigError> {
        self.url
            .parse()
            .map_err(|_| invalid("influx.url", format!("invalid URL: {}", self.url)))
    }
}

// ── Runtime conversion ──────────────────────────────────────────────

impl BusSettings {
    pub fn qos(&self) -> Result<QoS, ConfigError> {
        QoS::try_from(self.qos).map_err(|reason| invalid("bus.qos", reason))
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            clean_session: self.clean_session,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                max_delay: Duration::from_secs(self.reconnect_max_secs),
            },
        }
    }
}

impl DatabaseSettings {
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        let ssl_mode: PgSslMode = self
            .ssl_mode
            .parse()
            .map_err(|_| invalid("database.ssl_mode", self.ssl_mode.clone()))?;

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database)
            .ssl_mode(ssl_mode)
            .application_name("gpsno-sync");
        if let Some(ref password) = self.password {
            options = options.password(password.expose_secret());
        }
        Ok(options)
    }
}

impl Config {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            channel: self.database.channel.clone(),
            dispatch_timeout: Duration::from_secs(self.capture.dispatch_timeout_secs),
            idle_probe: Duration::from_secs(self.capture.idle_probe_secs),
            max_in_flight: self.capture.max_in_flight,
        }
    }

    pub fn sync_config(&self) -> Result<SyncConfig, ConfigError> {
        Ok(SyncConfig {
            base_topic: self.bus.base_topic.clone(),
            qos: self.bus.qos()?,
            publish_timeout: Duration::from_secs(self.bus.publish_timeout_secs),
            handler_timeout: Duration::from_secs(self.service.handler_timeout_secs),
            resync_on_start: self.service.resync_on_start,
        })
    }
}

impl InfluxSettings {
    pub fn influx_config(&self) -> Result<InfluxConfig, ConfigError> {
        Ok(InfluxConfig {
            url: self.parsed_url()?,
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            token: self.token.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
        }
    }
}
