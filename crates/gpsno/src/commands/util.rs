//! Shared builders for the database, bus and sink connections.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gpsno_api::{
    BufferedSink, ChangeCaptureListener, InfluxWriter, TimeSeriesSink,
    bus::MqttTransport,
    capture::{PgNotificationSource, PgTriggerInstaller},
};
use gpsno_config::{Config, DatabaseSettings};
use gpsno_core::BusLink;

use crate::error::CliError;

/// How long a one-shot command waits for the broker's first ConnAck.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn connect_pool(settings: &DatabaseSettings) -> Result<PgPool, CliError> {
    let options = settings.connect_options()?;
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect_with(options)
        .await
        .map_err(|source| CliError::DatabaseUnreachable {
            target: format!("{}:{}/{}", settings.host, settings.port, settings.database),
            source,
        })
}

/// Change capture over a dedicated `LISTEN` connection.
pub async fn capture(
    config: &Config,
    pool: &PgPool,
    cancel: CancellationToken,
) -> Result<ChangeCaptureListener, CliError> {
    let source = PgNotificationSource::connect(pool).await?;
    Ok(ChangeCaptureListener::new(
        config.capture_config(),
        Arc::new(PgTriggerInstaller::new(pool.clone())),
        Box::new(source),
        cancel,
    ))
}

/// Start the MQTT client. The transport handle is kept separately so the
/// caller can shut it down after the service.
pub fn start_bus(config: &Config, cancel: CancellationToken) -> (Arc<MqttTransport>, BusLink) {
    let (transport, inbound) = MqttTransport::start(&config.bus.mqtt_config(), cancel);
    let transport = Arc::new(transport);
    let bus = BusLink {
        transport: transport.clone(),
        inbound,
        connections: transport.connections(),
    };
    (transport, bus)
}

/// Wait until the broker has accepted at least one connection.
pub async fn wait_connected(config: &Config, bus: &mut BusLink) -> Result<(), CliError> {
    let connected = tokio::time::timeout(
        CONNECT_TIMEOUT,
        bus.connections.wait_for(|connects| *connects > 0),
    )
    .await;
    match connected {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(CliError::BrokerUnreachable {
            target: format!("{}:{}", config.bus.host, config.bus.port),
            seconds: CONNECT_TIMEOUT.as_secs(),
        }),
    }
}

/// Buffered Influx writer, when `[influx]` is configured.
pub async fn start_sink(
    config: &Config,
    cancel: CancellationToken,
) -> Result<Option<Arc<BufferedSink>>, CliError> {
    let Some(ref settings) = config.influx else {
        info!("no [influx] section, measurement ingest disabled");
        return Ok(None);
    };

    let writer = InfluxWriter::new(&settings.influx_config()?)?;
    if let Err(e) = writer.health().await {
        warn!(error = %e, "InfluxDB health check failed, starting anyway");
    }
    let inner: Arc<dyn TimeSeriesSink> = Arc::new(writer);
    Ok(Some(Arc::new(BufferedSink::spawn(
        inner,
        settings.batch_config(),
        cancel,
    ))))
}
