use thiserror::Error;

/// Boxed error returned by bus handlers and table listeners.
///
/// Handlers live in downstream crates with their own error types, so the
/// plumbing here only requires something displayable and thread-safe.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for the `gpsno-api` crate.
///
/// Covers every wire-level failure mode: topic addressing, the message bus,
/// Postgres change capture, and the time-series sink. `gpsno-core` maps
/// these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Topics ──────────────────────────────────────────────────────
    /// A topic template or subscription filter could not be compiled.
    #[error("Malformed topic template '{template}': {reason}")]
    MalformedTemplate { template: String, reason: String },

    /// An inbound topic did not match the expected template.
    #[error("Topic '{topic}' does not match template '{template}'")]
    NoMatch { topic: String, template: String },

    /// A value cannot be used as a single topic segment.
    #[error("Invalid topic segment '{segment}': {reason}")]
    InvalidSegment {
        segment: String,
        reason: &'static str,
    },

    // ── Bus ─────────────────────────────────────────────────────────
    /// No registered route matches the inbound topic.
    #[error("No handler registered for topic '{topic}'")]
    NoHandler { topic: String },

    /// A routed handler returned an error.
    #[error("Handler for '{topic}' failed: {source}")]
    Handler {
        topic: String,
        #[source]
        source: BoxError,
    },

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// The bus client rejected a request or lost its connection.
    #[error("Bus transport error: {0}")]
    Transport(String),

    /// JSON (de)serialization of a bus payload failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Change capture ──────────────────────────────────────────────
    /// Database error (trigger installation, LISTEN, probe).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A table or channel name is not a plain SQL identifier.
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// The dedicated listening connection is gone.
    #[error("Change capture connection lost: {0}")]
    ConnectionLost(String),

    /// `start()` was called on a listener that already consumed its source.
    #[error("Change capture listener already started")]
    AlreadyStarted,

    /// A notification payload or row image could not be decoded.
    #[error("Failed to parse change notification: {0}")]
    ParseFailed(String),

    // ── Time-series sink ────────────────────────────────────────────
    /// HTTP transport error talking to the sink.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The sink answered with a non-success status.
    #[error("Time-series sink rejected write (HTTP {status}): {body}")]
    SinkRejected { status: u16, body: String },

    // ── Internal ────────────────────────────────────────────────────
    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns `true` if this is a transient error worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::Transport(_) | Self::ConnectionLost(_) => true,
            Self::Database(e) => matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut),
            _ => false,
        }
    }

    /// Returns `true` if this error means the listening connection is unusable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}
