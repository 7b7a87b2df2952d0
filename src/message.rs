//! The message type carried through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single delivery from the remote queue.
///
/// The payload is opaque to the engine. The only field the pipeline ever
/// inspects is `nack`; everything else rides through untouched, so a
/// handler can stash hints (e.g. a visibility extension) in `attributes`
/// and still see them at ack time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Queue-assigned message id. Stable across redeliveries.
    pub id: String,
    /// Delivery handle used for ack/nack. Unique per delivery attempt.
    pub receipt_handle: String,
    /// Opaque payload.
    pub body: String,
    /// When true, the dispatcher returns the message for redelivery
    /// instead of acking it.
    #[serde(default)]
    pub nack: bool,
    /// Opaque extension data, preserved end-to-end.
    #[serde(default = "empty_attributes")]
    pub attributes: serde_json::Value,
    /// When this delivery was handed to a consumer.
    pub received_at: DateTime<Utc>,
}

fn empty_attributes() -> serde_json::Value {
    serde_json::json!({})
}

impl Message {
    /// Create a message for a fresh delivery attempt.
    pub fn new(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            nack: false,
            attributes: empty_attributes(),
            received_at: Utc::now(),
        }
    }

    /// Mark this message for redelivery. Handlers write the result to the
    /// done channel to signal "return this for retry".
    pub fn into_nack(mut self) -> Self {
        self.nack = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_nack() {
        let msg = Message::new("m-1", "rh-1", "payload");
        assert!(!msg.nack);
        assert!(msg.into_nack().nack);
    }

    #[test]
    fn test_nack_and_attributes_default_when_absent() {
        // Wire messages from older producers omit both fields.
        let msg: Message = serde_json::from_value(serde_json::json!({
            "id": "m-1",
            "receipt_handle": "rh-1",
            "body": "payload",
            "received_at": "2026-01-10T12:00:00Z",
        }))
        .unwrap();
        assert!(!msg.nack);
        assert_eq!(msg.attributes, serde_json::json!({}));
    }

    #[test]
    fn test_attributes_preserved_through_roundtrip() {
        let mut msg = Message::new("m-2", "rh-2", "payload");
        msg.attributes = serde_json::json!({"visibility_hint": 120});
        let back: Message = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.attributes["visibility_hint"], 120);
    }
}
