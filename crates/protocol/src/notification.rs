//! Notification stream (server → client) vocabulary
//!
//! The stream is plain SSE. Every named event carries a JSON-encoded object
//! in its `data` field, except the two reserved protocol events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ProtocolError;

/// Sent once per connection; listeners must be re-registered on receipt.
pub const CONNECTION_ESTABLISHED: &str = "connection_established";
/// Keep-alive, carries nothing.
pub const HEARTBEAT: &str = "heartbeat";

pub const MESSAGE: &str = "message";
pub const BROADCAST: &str = "broadcast";
pub const NOTIFICATION: &str = "notification";
pub const OCR_TASK_UPDATE: &str = "ocr_task_update";

/// Reserved events are handled by the client, never forwarded.
pub const RESERVED_EVENTS: [&str; 2] = [CONNECTION_ESTABLISHED, HEARTBEAT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind<'a> {
    ConnectionEstablished,
    Heartbeat,
    Business(&'a str),
}

pub fn classify(event: &str) -> NotificationKind<'_> {
    match event {
        CONNECTION_ESTABLISHED => NotificationKind::ConnectionEstablished,
        HEARTBEAT => NotificationKind::Heartbeat,
        other => NotificationKind::Business(other),
    }
}

pub fn is_reserved(event: &str) -> bool {
    RESERVED_EVENTS.contains(&event)
}

/// Decode the `data` field of a business event.
pub fn decode_payload(data: &str) -> Result<Value, ProtocolError> {
    Ok(serde_json::from_str(data)?)
}

/// Convert a decoded payload into a concrete type.
pub fn decode_typed<T: DeserializeOwned>(value: &Value) -> Result<T, ProtocolError> {
    Ok(T::deserialize(value)?)
}

/// Progress report for an OCR extraction job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrTaskUpdate {
    pub task_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reserved_and_business_events() {
        assert_eq!(
            classify("connection_established"),
            NotificationKind::ConnectionEstablished
        );
        assert_eq!(classify("heartbeat"), NotificationKind::Heartbeat);
        assert_eq!(
            classify("ocr_task_update"),
            NotificationKind::Business("ocr_task_update")
        );
        assert!(is_reserved("heartbeat"));
        assert!(!is_reserved("broadcast"));
    }

    #[test]
    fn decodes_ocr_task_update() {
        let value = decode_payload(r#"{"taskId":"42","status":"done","pages":3}"#)
            .expect("decode payload");
        let update: OcrTaskUpdate = decode_typed(&value).expect("typed payload");
        assert_eq!(update.task_id, "42");
        assert_eq!(update.status, "done");
        assert_eq!(update.progress, None);
        assert_eq!(update.extra.get("pages"), Some(&Value::from(3)));
    }

    #[test]
    fn rejects_malformed_payload() {
        let err = decode_payload("{not valid json").expect_err("should fail");
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn typed_decode_reports_missing_fields() {
        let value = decode_payload(r#"{"status":"done"}"#).expect("decode payload");
        assert!(decode_typed::<OcrTaskUpdate>(&value).is_err());
    }
}
