//! Time-series sink.
//!
//! A [`Point`] is `(measurement, tags, fields, timestamp)`; sinks accept
//! batches of them. [`BufferedSink`] adds size- and interval-based batching
//! in front of any other sink.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

// ── Point ────────────────────────────────────────────────────────────

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

/// One time-series sample. Tags and fields are kept sorted by key.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Encode as one line of InfluxDB line protocol (nanosecond precision).
    ///
    /// Empty tag values are omitted; the protocol does not allow them.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    FieldValue::Float(v) => format!("{v:?}"),
                    FieldValue::Integer(v) => format!("{v}i"),
                    FieldValue::Boolean(v) => v.to_string(),
                    FieldValue::Text(v) => format!("\"{}\"", escape(v, &['"'])),
                };
                format!("{}={value}", escape(key, &[',', '=', ' ']))
            })
            .collect();

        let nanos = self.timestamp.timestamp_nanos_opt().unwrap_or_default();
        let _ = write!(line, " {} {nanos}", fields.join(","));
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ── Sink trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<(), Error>;
}

// ── BufferedSink ─────────────────────────────────────────────────────

/// Batching policy for [`BufferedSink`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush as soon as this many points are buffered. Default: 100.
    pub batch_size: usize,
    /// Flush whatever is buffered at least this often. Default: 10s.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Buffers points and writes them to an inner sink in the background.
///
/// `write` only enqueues. Write failures of the inner sink are logged and
/// the batch is dropped.
pub struct BufferedSink {
    tx: mpsc::Sender<Vec<Point>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BufferedSink {
    pub fn spawn(
        inner: Arc<dyn TimeSeriesSink>,
        config: BatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.batch_size.max(1));
        let task = tokio::spawn(flush_loop(inner, config, rx, cancel));
        Self {
            tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Flush what is buffered and stop the background task.
    pub async fn close(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            // An empty batch marks the end of input.
            let _ = self.tx.send(Vec::new()).await;
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sink flush task failed");
            }
        }
    }
}

#[async_trait]
impl TimeSeriesSink for BufferedSink {
    async fn write(&self, points: &[Point]) -> Result<(), Error> {
        if points.is_empty() {
            return Ok(());
        }
        self.tx
            .send(points.to_vec())
            .await
            .map_err(|_| Error::Transport("time-series buffer closed".into()))
    }
}

async fn flush_loop(
    inner: Arc<dyn TimeSeriesSink>,
    config: BatchConfig,
    mut rx: mpsc::Receiver<Vec<Point>>,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<Point> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) if batch.is_empty() => break,
                Some(batch) => {
                    buffer.extend(batch);
                    if buffer.len() >= config.batch_size {
                        flush(inner.as_ref(), &mut buffer).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(inner.as_ref(), &mut buffer).await,
        }
    }

    flush(inner.as_ref(), &mut buffer).await;
    tracing::debug!("sink flush loop exiting");
}

async fn flush(inner: &dyn TimeSeriesSink, buffer: &mut Vec<Point>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    match inner.write(&batch).await {
        Ok(()) => tracing::debug!(points = batch.len(), "flushed time-series batch"),
        Err(e) => tracing::error!(points = batch.len(), error = %e, "time-series write failed"),
    }
}
