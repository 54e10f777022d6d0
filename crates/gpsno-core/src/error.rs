// ── Core error types ──
//
// Domain errors for reconciliation. Wire-level failures from `gpsno-api`
// are folded into a handful of variants by the `From` impl below, so
// callers reason about "validation", "transport", "database", not about
// MQTT packets or HTTP statuses.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Domain errors ────────────────────────────────────────────────
    /// A required identity field is missing or malformed. The entity is
    /// rejected and nothing is persisted.
    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    /// A referenced entity does not exist.
    #[error("{entity_type} not found: {identifier}")]
    ReferenceNotFound {
        entity_type: &'static str,
        identifier: String,
    },

    /// An inbound payload or row image could not be decoded.
    #[error("Failed to parse {what}: {message}")]
    ParseFailed { what: &'static str, message: String },

    // ── Infrastructure errors ────────────────────────────────────────
    #[error("Bus transport error: {message}")]
    Transport { message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Database error: {message}")]
    Database { message: String },

    /// Change capture lost its listening connection. Fatal for the service.
    #[error("Change capture connection lost: {message}")]
    CaptureLost { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    /// Returns `true` if the owning process should stop rather than carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CaptureLost { .. } | Self::Config { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseFailed {
            what: "JSON payload",
            message: err.to_string(),
        }
    }
}

// ── Conversion from wire-level errors ────────────────────────────────

impl From<gpsno_api::Error> for CoreError {
    fn from(err: gpsno_api::Error) -> Self {
        use gpsno_api::Error as Api;

        match err {
            Api::InvalidSegment { segment, reason } => CoreError::ValidationFailed {
                message: format!("'{segment}' cannot be used as a topic segment: {reason}"),
            },
            Api::NoMatch { topic, template } => CoreError::ValidationFailed {
                message: format!("topic '{topic}' does not match '{template}'"),
            },
            Api::MalformedTemplate { .. } | Api::InvalidIdentifier(_) | Api::InvalidUrl(_) => {
                CoreError::Config {
                    message: err.to_string(),
                }
            }
            Api::Timeout {
                operation,
                timeout_ms,
            } => CoreError::Timeout {
                operation,
                timeout_ms,
            },
            Api::Serialization(e) => CoreError::ParseFailed {
                what: "bus payload",
                message: e.to_string(),
            },
            Api::ParseFailed(message) => CoreError::ParseFailed {
                what: "change notification",
                message,
            },
            Api::Database(e) => CoreError::Database {
                message: e.to_string(),
            },
            Api::ConnectionLost(message) => CoreError::CaptureLost { message },
            Api::Transport(message) => CoreError::Transport { message },
            Api::NoHandler { .. }
            | Api::Handler { .. }
            | Api::Http(_)
            | Api::SinkRejected { .. } => CoreError::Transport {
                message: err.to_string(),
            },
            Api::AlreadyStarted | Api::Task(_) => CoreError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_connection_is_fatal() {
        let err = CoreError::from(gpsno_api::Error::ConnectionLost("eof".into()));
        assert!(err.is_fatal());
        assert!(matches!(err, CoreError::CaptureLost { .. }));
    }

    #[test]
    fn bad_segment_is_a_validation_error() {
        let err = CoreError::from(gpsno_api::Error::InvalidSegment {
            segment: "a/b".into(),
            reason: "segment contains the '/' separator",
        });
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn publish_timeout_keeps_operation() {
        let err = CoreError::from(gpsno_api::Error::Timeout {
            operation: "publish",
            timeout_ms: 5000,
        });
        assert_eq!(err.to_string(), "publish timed out after 5000ms");
    }
}
