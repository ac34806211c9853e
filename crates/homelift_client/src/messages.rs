//! Notification channel frames. Server → client JSON text frames.
//!
//! A frame is actionable only when it carries a string `message`; every other
//! field is kept opaquely and handed to the application with the event.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client-side event identity, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        EventId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Actionable content of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPayload {
    pub message: String,
    pub kind: Option<String>,
    pub extra: Map<String, Value>,
}

// Keys owned by `NotificationEvent`; dropped from the opaque extras.
const RESERVED_KEYS: [&str; 5] = ["id", "message", "type", "created_at", "is_read"];

/// Parse a text frame. `Ok(None)` for well-formed frames without a string `message`.
pub fn parse_frame(text: &str) -> Result<Option<NotificationPayload>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut fields) = value else {
        return Ok(None);
    };
    let message = match fields.remove("message") {
        Some(Value::String(message)) => message,
        _ => return Ok(None),
    };
    let kind = match fields.remove("type") {
        Some(Value::String(kind)) => Some(kind),
        _ => None,
    };
    fields.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
    Ok(Some(NotificationPayload {
        message,
        kind,
        extra: fields,
    }))
}

/// A received notification as held by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: EventId,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotificationEvent {
    /// Stamp a payload at receipt time.
    pub fn received(payload: NotificationPayload) -> Self {
        Self {
            id: EventId::next(),
            message: payload.message,
            created_at: Utc::now(),
            is_read: false,
            kind: payload.kind,
            extra: payload.extra,
        }
    }
}

/// Notification as listed by the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub is_read: bool,
}

impl From<NotificationRecord> for NotificationEvent {
    /// Fetched notifications get a local id; the server id is kept as `server_id`.
    fn from(record: NotificationRecord) -> Self {
        let mut extra = Map::new();
        extra.insert("server_id".into(), Value::from(record.id));
        let optional = [
            ("title", record.title),
            ("sender_name", record.sender_name),
            ("recipient_name", record.recipient_name),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                extra.insert(key.into(), Value::from(value));
            }
        }
        Self {
            id: EventId::next(),
            message: record.message,
            created_at: record.created_at,
            is_read: record.is_read,
            kind: record.kind,
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_message_and_extras() {
        let payload = parse_frame(r#"{"message":"Paid","type":"payment","booking_id":7,"id":99}"#)
            .unwrap()
            .unwrap();
        assert_eq!(payload.message, "Paid");
        assert_eq!(payload.kind.as_deref(), Some("payment"));
        assert_eq!(payload.extra.get("booking_id"), Some(&Value::from(7)));
        assert!(!payload.extra.contains_key("id"));
    }

    #[test]
    fn frames_without_string_message_are_ignored() {
        assert_eq!(parse_frame(r#"{"status":"ok"}"#).unwrap(), None);
        assert_eq!(parse_frame(r#"{"message":42}"#).unwrap(), None);
        assert_eq!(parse_frame(r#"["message"]"#).unwrap(), None);
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn event_ids_are_distinct() {
        let payload = NotificationPayload {
            message: "x".into(),
            kind: None,
            extra: Map::new(),
        };
        let a = NotificationEvent::received(payload.clone());
        let b = NotificationEvent::received(payload);
        assert!(b.id > a.id);
        assert!(!a.is_read);
    }

    #[test]
    fn fetched_record_keeps_server_fields() {
        let record: NotificationRecord = serde_json::from_str(
            r#"{"id":12,"title":"Booking","type":"booking","message":"Booked",
                "created_at":"2026-03-01T10:00:00Z","sender_name":"Ravi","is_read":true}"#,
        )
        .unwrap();
        let event = NotificationEvent::from(record);
        assert_eq!(event.message, "Booked");
        assert!(event.is_read);
        assert_eq!(event.kind.as_deref(), Some("booking"));
        assert_eq!(event.extra.get("server_id"), Some(&Value::from(12)));
        assert_eq!(event.extra.get("sender_name"), Some(&Value::from("Ravi")));
        assert!(!event.extra.contains_key("recipient_name"));
    }
}
