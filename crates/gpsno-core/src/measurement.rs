// ── Measurement ingest ──
//
// Stations publish batches of readings on `{base}/v1/measurements/{station}`.
// Each reading becomes one time-series point named after its type.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpsno_api::topic::MEASUREMENTS;
use gpsno_api::{BoxError, BusMessage, MessageHandler, Point, TimeSeriesSink, TopicSpace};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;
use crate::model::MacAddress;
use crate::reconcile::{DropReason, Outcome};

/// One reading inside a measurement envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub unit: String,
    /// The peer a ranging reading refers to, if any.
    #[serde(default)]
    pub target: String,
}

impl Measurement {
    /// Upper-case type and unit, canonical target address.
    pub fn normalized(&self) -> Result<Self, CoreError> {
        let kind = self.kind.trim().to_uppercase();
        let unit = self.unit.trim().to_uppercase();
        if kind.is_empty() {
            return Err(CoreError::validation("measurement type is required"));
        }
        if unit.is_empty() {
            return Err(CoreError::validation("measurement unit is required"));
        }

        Ok(Self {
            value: self.value,
            kind,
            unit,
            target: MacAddress::normalize(&self.target),
        })
    }

    pub fn to_point(&self, station_id: &str, source: &str, at: DateTime<Utc>) -> Point {
        let mut point = Point::new(&self.kind, at)
            .tag("station_id", station_id)
            .tag("type", &self.kind)
            .tag("unit", &self.unit)
            .field("value", self.value)
            .field("meta_source", source);
        if !self.target.is_empty() {
            point = point.tag("target", &self.target);
        }
        point
    }
}

/// Validate a batch and turn it into points. All-or-nothing: one invalid
/// reading rejects the batch.
pub fn to_points(
    station_id: &str,
    source: &str,
    readings: &[Measurement],
    at: DateTime<Utc>,
) -> Result<Vec<Point>, CoreError> {
    if readings.is_empty() {
        return Err(CoreError::validation("measurement batch is empty"));
    }
    let source = MacAddress::normalize(source);

    readings
        .iter()
        .map(|m| {
            m.normalized()
                .map(|m| m.to_point(station_id, &source, at))
        })
        .collect()
}

/// Bus handler feeding a [`TimeSeriesSink`].
pub struct MeasurementHandler {
    sink: Arc<dyn TimeSeriesSink>,
    topics: Arc<TopicSpace>,
}

impl MeasurementHandler {
    pub fn new(sink: Arc<dyn TimeSeriesSink>, topics: Arc<TopicSpace>) -> Self {
        Self { sink, topics }
    }

    pub async fn on_message(&self, message: &BusMessage) -> Result<Outcome, CoreError> {
        if message.is_empty() {
            return Ok(Outcome::Dropped(DropReason::Empty));
        }

        if message.is_echo() {
            return Ok(Outcome::Dropped(DropReason::Echo));
        }

        let wire = message.decode::<Vec<Measurement>>()?;
        let Some(source) = wire.source.external_id() else {
            return Err(CoreError::validation("measurement source is required"));
        };

        let station_id = self.topics.extract_id(&message.topic, MEASUREMENTS)?;
        let points = to_points(&station_id, source, &wire.data, Utc::now())?;
        self.sink.write(&points).await?;

        debug!(station_id = %station_id, points = points.len(), "measurements recorded");
        Ok(Outcome::Recorded(points.len()))
    }
}

#[async_trait]
impl MessageHandler for MeasurementHandler {
    async fn handle(&self, message: BusMessage) -> Result<(), BoxError> {
        self.on_message(&message).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn readings_become_tagged_points() {
        let readings: Vec<Measurement> = serde_json::from_value(json!([
            { "value": 1.5, "type": "uwb", "unit": "m", "target": "AABBCCDDEE01" },
            { "value": -40.0, "type": "rssi", "unit": "dbm" }
        ]))
        .unwrap();

        let points = to_points("aabbccddeeff", "AA-BB-CC-DD-EE-FF", &readings, at()).unwrap();
        assert_eq!(
            points[0].to_line_protocol(),
            "UWB,station_id=aabbccddeeff,target=aa:bb:cc:dd:ee:01,type=UWB,unit=M \
             meta_source=\"aa:bb:cc:dd:ee:ff\",value=1.5 1700000000000000000"
        );
        assert!(!points[1].tags.contains_key("target"));
    }

    #[test]
    fn batch_is_rejected_as_a_whole() {
        let readings = vec![
            Measurement {
                value: 1.0,
                kind: "UWB".into(),
                unit: "M".into(),
                target: String::new(),
            },
            Measurement {
                value: 2.0,
                kind: "UWB".into(),
                unit: " ".into(),
                target: String::new(),
            },
        ];
        assert!(matches!(
            to_points("s", "src", &readings, at()),
            Err(CoreError::ValidationFailed { .. })
        ));
        assert!(to_points("s", "src", &[], at()).is_err());
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Point>>);

    #[async_trait]
    impl TimeSeriesSink for Collect {
        async fn write(&self, points: &[Point]) -> Result<(), gpsno_api::Error> {
            self.0.lock().unwrap().extend_from_slice(points);
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_writes_external_batches_only() {
        let sink = Arc::new(Collect::default());
        let handler = MeasurementHandler::new(sink.clone(), Arc::new(TopicSpace::new("gpsno")));
        let topic = "gpsno/v1/measurements/aabbccddeeff";

        let echo = BusMessage::new(
            topic,
            json!({ "source": "SYNC", "data": [{ "value": 1.0, "type": "UWB", "unit": "M" }] })
                .to_string(),
        );
        assert_eq!(
            handler.on_message(&echo).await.unwrap(),
            Outcome::Dropped(DropReason::Echo)
        );
        let malformed_echo = BusMessage::new(topic, r#"{"source": "SYNC", "data": {"value": "x"}}"#);
        assert_eq!(
            handler.on_message(&malformed_echo).await.unwrap(),
            Outcome::Dropped(DropReason::Echo)
        );

        let anonymous = BusMessage::new(
            topic,
            json!({ "data": [{ "value": 1.0, "type": "UWB", "unit": "M" }] }).to_string(),
        );
        assert!(handler.on_message(&anonymous).await.is_err());

        let real = BusMessage::new(
            topic,
            json!({
                "source": "aa:bb:cc:dd:ee:ff",
                "data": [{ "value": 1.0, "type": "UWB", "unit": "M" }]
            })
            .to_string(),
        );
        assert_eq!(handler.on_message(&real).await.unwrap(), Outcome::Recorded(1));

        let points = sink.0.lock().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].tags["station_id"], "aabbccddeeff");
    }
}
