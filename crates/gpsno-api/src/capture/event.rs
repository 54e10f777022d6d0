// ── Row-change events ──
//
// The JSON document emitted by the generic trigger function, plus a typed
// decode step so raw row images never travel past this module.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Kind of row mutation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One row mutation as delivered over the notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChangeEvent {
    pub operation: Operation,
    pub table: String,
    #[serde(default)]
    pub old_data: Option<Value>,
    #[serde(default)]
    pub new_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// A change decoded into a concrete row type.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Insert { after: T },
    Update { before: Option<T>, after: T },
    Delete { before: T },
}

impl<T> Change<T> {
    /// The row as it exists after the change (or as it was, for deletes).
    pub fn row(&self) -> &T {
        match self {
            Self::Insert { after } | Self::Update { after, .. } => after,
            Self::Delete { before } => before,
        }
    }

    pub fn into_row(self) -> T {
        match self {
            Self::Insert { after } | Self::Update { after, .. } => after,
            Self::Delete { before } => before,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }
}

impl TableChangeEvent {
    /// Parse a raw notification payload.
    pub fn parse(payload: &str) -> Result<Self, Error> {
        serde_json::from_str(payload).map_err(|e| Error::ParseFailed(e.to_string()))
    }

    /// Decode the row images into `T`.
    ///
    /// Fails with [`Error::ParseFailed`] when an image required by the
    /// operation is missing or does not deserialize.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Change<T>, Error> {
        match self.operation {
            Operation::Insert => Ok(Change::Insert {
                after: self.image(self.new_data.as_ref(), "new_data")?,
            }),
            Operation::Update => Ok(Change::Update {
                before: match self.old_data {
                    Some(Value::Null) | None => None,
                    Some(ref old) => Some(self.image(Some(old), "old_data")?),
                },
                after: self.image(self.new_data.as_ref(), "new_data")?,
            }),
            Operation::Delete => Ok(Change::Delete {
                before: self.image(self.old_data.as_ref(), "old_data")?,
            }),
        }
    }

    fn image<T: DeserializeOwned>(&self, image: Option<&Value>, field: &str) -> Result<T, Error> {
        let value = image
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                Error::ParseFailed(format!(
                    "{} on '{}' without {field}",
                    self.operation, self.table
                ))
            })?;
        T::deserialize(value).map_err(|e| {
            Error::ParseFailed(format!("{field} of '{}' row: {e}", self.table))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Row {
        id: i64,
        name: String,
    }

    fn payload(operation: &str, old: Value, new: Value) -> String {
        json!({
            "operation": operation,
            "table": "stations",
            "old_data": old,
            "new_data": new,
            "timestamp": "2025-03-01T12:00:00.123456+00:00"
        })
        .to_string()
    }

    #[test]
    fn parses_trigger_payload() {
        let event =
            TableChangeEvent::parse(&payload("INSERT", Value::Null, json!({"id": 1, "name": "a"})))
                .unwrap();
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.table, "stations");
        assert!(event.old_data.is_none());
        assert_eq!(event.timestamp.timestamp(), 1_740_830_400);
    }

    #[test]
    fn decode_update_keeps_both_images() {
        let event = TableChangeEvent::parse(&payload(
            "UPDATE",
            json!({"id": 1, "name": "old"}),
            json!({"id": 1, "name": "new"}),
        ))
        .unwrap();

        let change = event.decode::<Row>().unwrap();
        assert_eq!(
            change,
            Change::Update {
                before: Some(Row { id: 1, name: "old".into() }),
                after: Row { id: 1, name: "new".into() },
            }
        );
        assert_eq!(change.row().name, "new");
    }

    #[test]
    fn decode_delete_uses_before_image() {
        let event =
            TableChangeEvent::parse(&payload("DELETE", json!({"id": 9, "name": "gone"}), Value::Null))
                .unwrap();
        let change = event.decode::<Row>().unwrap();
        assert!(change.is_delete());
        assert_eq!(change.into_row().id, 9);
    }

    #[test]
    fn missing_image_is_parse_failure() {
        let event =
            TableChangeEvent::parse(&payload("INSERT", Value::Null, Value::Null)).unwrap();
        assert!(matches!(event.decode::<Row>(), Err(Error::ParseFailed(_))));
    }

    #[test]
    fn wrong_row_shape_is_parse_failure() {
        let event =
            TableChangeEvent::parse(&payload("INSERT", Value::Null, json!({"id": "x"}))).unwrap();
        assert!(matches!(event.decode::<Row>(), Err(Error::ParseFailed(_))));
    }

    #[test]
    fn garbage_payload_is_parse_failure() {
        assert!(matches!(
            TableChangeEvent::parse("{not json"),
            Err(Error::ParseFailed(_))
        ));
        assert!(matches!(
            TableChangeEvent::parse(r#"{"operation":"TRUNCATE","table":"t","timestamp":"2025-01-01T00:00:00Z"}"#),
            Err(Error::ParseFailed(_))
        ));
    }

    #[test]
    fn operation_display_is_uppercase() {
        assert_eq!(Operation::Delete.to_string(), "DELETE");
        assert_eq!("UPDATE".parse::<Operation>().unwrap(), Operation::Update);
    }
}
