#![allow(clippy::unwrap_used)]
// Layered loading: defaults, file, environment.

use std::path::Path;
use std::time::Duration;

use figment::Jail;
use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;

use gpsno_config::{ConfigError, LogFormat, load_config};

// ── Helpers ─────────────────────────────────────────────────────────

fn load(path: &str) -> Result<gpsno_config::Config, figment::Error> {
    load_config(Some(Path::new(path))).map_err(|e| figment::Error::from(e.to_string()))
}

// ── File + environment ──────────────────────────────────────────────

#[test]
fn file_values_override_defaults() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "config.toml",
            r#"
            [bus]
            host = "broker.local"
            base_topic = "site-a"
            qos = 2

            [database]
            database = "stations"
            ssl_mode = "require"

            [logging]
            format = "json"
            "#,
        )?;

        let config = load("config.toml")?;
        assert_eq!(config.bus.host, "broker.local");
        assert_eq!(config.bus.port, 1883);
        assert_eq!(config.database.database, "stations");
        assert_eq!(config.database.channel, "table_changes");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.influx.is_none());

        let sync = config.sync_config().unwrap();
        assert_eq!(sync.base_topic, "site-a");
        assert_eq!(sync.qos, gpsno_api::QoS::ExactlyOnce);
        Ok(())
    });
}

#[test]
fn environment_overrides_file() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "config.toml",
            r#"
            [bus]
            host = "broker.local"
            "#,
        )?;
        jail.set_env("GPSNO_BUS__HOST", "broker.prod");
        jail.set_env("GPSNO_BUS__PORT", "8883");
        jail.set_env("GPSNO_DATABASE__PASSWORD", "s3cret");

        let config = load("config.toml")?;
        assert_eq!(config.bus.host, "broker.prod");
        assert_eq!(config.bus.port, 8883);
        assert_eq!(
            config.database.password.as_ref().unwrap().expose_secret(),
            "s3cret"
        );
        Ok(())
    });
}

#[test]
fn influx_section_enables_the_sink() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "config.toml",
            r#"
            [influx]
            url = "http://influx:8086"
            org = "gpsno"
            bucket = "measurements"
            token = "abc"
            flush_interval_secs = 2
            "#,
        )?;

        let config = load("config.toml")?;
        let influx = config.influx.as_ref().unwrap();
        assert_eq!(influx.batch_size, 100);

        let batch = influx.batch_config();
        assert_eq!(batch.flush_interval, Duration::from_secs(2));
        let runtime = influx.influx_config().unwrap();
        assert_eq!(runtime.url.as_str(), "http://influx:8086/");
        Ok(())
    });
}

// ── Failures ────────────────────────────────────────────────────────

#[test]
fn invalid_values_fail_validation() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "config.toml",
            r#"
            [database]
            ssl_mode = "whenever"
            "#,
        )?;

        let err = load_config(Some(Path::new("config.toml"))).unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation { ref field, .. } if field == "database.ssl_mode"),
            "got: {err}"
        );
        Ok(())
    });
}

#[test]
fn explicit_missing_file_is_an_error() {
    Jail::expect_with(|_jail| {
        let err = load_config(Some(Path::new("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
        Ok(())
    });
}

#[test]
fn printed_config_hides_secrets() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "config.toml",
            r#"
            [bus]
            username = "sync"
            password = "mqtt-pass"
            "#,
        )?;

        let text = load("config.toml")?.to_redacted_toml().unwrap();
        assert!(text.contains("username = \"sync\""));
        assert!(!text.contains("mqtt-pass"), "secret leaked:\n{text}");
        Ok(())
    });
}
