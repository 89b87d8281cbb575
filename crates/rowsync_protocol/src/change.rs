//! Change events delivered by the push channel.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Type of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Row was inserted.
    #[serde(alias = "INSERT")]
    Insert,
    /// Row was updated.
    #[serde(alias = "UPDATE")]
    Update,
    /// Row was deleted.
    #[serde(alias = "DELETE")]
    Delete,
}

impl ChangeKind {
    /// Returns true for inserts and updates.
    pub fn is_write(&self) -> bool {
        matches!(self, ChangeKind::Insert | ChangeKind::Update)
    }
}

/// A single row change.
///
/// Wire shape:
///
/// ```json
/// {"type": "update", "row": {"id": 1, "title": "x"}, "timestamp": "2024-05-01T10:00:00Z"}
/// ```
///
/// A `timestamp` marks an event that arrived asynchronously over the push
/// channel. Events built on a local call path carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<R> {
    /// Type of change.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// The affected row. For deletes only the key columns are required.
    pub row: R,
    /// Commit timestamp stamped by the remote side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl<R> ChangeEvent<R> {
    /// Creates an insert event.
    pub fn insert(row: R) -> Self {
        Self {
            kind: ChangeKind::Insert,
            row,
            timestamp: None,
        }
    }

    /// Creates an update event.
    pub fn update(row: R) -> Self {
        Self {
            kind: ChangeKind::Update,
            row,
            timestamp: None,
        }
    }

    /// Creates a delete event.
    pub fn delete(row: R) -> Self {
        Self {
            kind: ChangeKind::Delete,
            row,
            timestamp: None,
        }
    }

    /// Stamps the event as delivered by the push channel.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Returns true if the event came from the push channel.
    pub fn is_remote(&self) -> bool {
        self.timestamp.is_some()
    }
}

impl<R: DeserializeOwned> ChangeEvent<R> {
    /// Decodes a JSON push payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] if the bytes are not a
    /// valid event for `R`.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

impl<R: Serialize> ChangeEvent<R> {
    /// Encodes the event as a JSON push payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `R` fails to serialize.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use crate::value::Value;

    #[test]
    fn decode_push_payload() {
        let event: ChangeEvent<Row> = ChangeEvent::from_json(
            br#"{"type": "UPDATE", "row": {"id": 3, "title": "x"}, "timestamp": "2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.row.get("id"), Some(&Value::Integer(3)));
        assert!(event.is_remote());
    }

    #[test]
    fn timestamp_is_optional() {
        let event: ChangeEvent<Row> =
            ChangeEvent::from_json(br#"{"type": "delete", "row": {"id": 3}}"#).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(!event.is_remote());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let cases: [&[u8]; 4] = [
            b"not json",
            br#"{"type": "upsert", "row": {"id": 1}}"#,
            br#"{"type": "insert"}"#,
            br#"{"type": "insert", "row": {"id": {"nested": true}}}"#,
        ];
        for bytes in cases {
            let err = ChangeEvent::<Row>::from_json(bytes).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
        }
    }

    #[test]
    fn local_events_have_no_timestamp() {
        let row = Row::new().with("id", 1);
        assert!(!ChangeEvent::insert(row.clone()).is_remote());
        assert!(ChangeEvent::update(row).with_timestamp("t1").is_remote());
        assert!(ChangeKind::Insert.is_write());
        assert!(!ChangeKind::Delete.is_write());
    }

    #[test]
    fn encodes_wire_shape() {
        let event = ChangeEvent::delete(Row::new().with("id", 2));
        let json: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["row"]["id"], 2);
        assert!(json.get("timestamp").is_none());
    }
}
