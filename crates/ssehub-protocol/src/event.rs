//! Event envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CLOSE_EVENT, id};

// ============================================================================
// Event
// ============================================================================

/// One addressable unit of push data.
///
/// `event_type` is serialized as `event` so the push intake body and the wire
/// record use the same field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id. Minted by the broker when left empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Groups callbacks on the consumer side and replay streams in the store.
    #[serde(rename = "event", default)]
    pub event_type: String,

    /// Opaque payload, JSON encoded on the wire.
    #[serde(default)]
    pub data: Value,
}

/// Reasons an event is rejected before it is persisted or enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEvent {
    #[error("event type is required")]
    MissingType,

    #[error("event data is required")]
    MissingData,

    #[error("event id and type must not contain line breaks")]
    LineBreak,
}

impl Event {
    /// Create an event without an id.
    pub fn new(event_type: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// The terminal record broadcast on broker shutdown.
    pub fn close() -> Self {
        Self::new(CLOSE_EVENT, Value::Object(serde_json::Map::new()))
    }

    /// Whether this is the terminal `close` record.
    pub fn is_close(&self) -> bool {
        self.event_type == CLOSE_EVENT
    }

    /// Check the event can be persisted and framed.
    pub fn validate(&self) -> Result<(), InvalidEvent> {
        if self.event_type.is_empty() {
            return Err(InvalidEvent::MissingType);
        }
        if self.data.is_null() {
            return Err(InvalidEvent::MissingData);
        }
        if has_line_break(&self.event_type) || has_line_break(&self.id) {
            return Err(InvalidEvent::LineBreak);
        }
        Ok(())
    }

    /// Mint an id if none was supplied.
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = id::next_id();
        }
    }

    /// Rebuild an event from the fields of a parsed wire record.
    ///
    /// `data` is the raw `data:` payload and must be valid JSON.
    pub fn from_record(
        id: impl Into<String>,
        event_type: impl Into<String>,
        data: &str,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            event_type: event_type.into(),
            data: serde_json::from_str(data)?,
        })
    }
}

fn has_line_break(value: &str) -> bool {
    value.contains(['\n', '\r'])
}

// ============================================================================
// UserEvent
// ============================================================================

/// An event addressed to one identifier, as it travels through the broker's
/// delivery queue.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub identifier: String,
    pub event: Event,
}

impl UserEvent {
    pub fn new(identifier: impl Into<String>, event: Event) -> Self {
        Self {
            identifier: identifier.into(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_requires_type_and_data() {
        assert_eq!(
            Event::new("", json!({"a": 1})).validate(),
            Err(InvalidEvent::MissingType)
        );
        assert_eq!(
            Event::new("update", Value::Null).validate(),
            Err(InvalidEvent::MissingData)
        );
        assert!(Event::new("update", json!("x")).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_line_breaks() {
        let event = Event::new("bad\ntype", json!(1));
        assert_eq!(event.validate(), Err(InvalidEvent::LineBreak));

        let event = Event::new("ok", json!(1)).with_id("1\r\n2");
        assert_eq!(event.validate(), Err(InvalidEvent::LineBreak));
    }

    #[test]
    fn test_ensure_id_keeps_existing() {
        let mut event = Event::new("update", json!(1)).with_id("42");
        event.ensure_id();
        assert_eq!(event.id, "42");

        let mut event = Event::new("update", json!(1));
        event.ensure_id();
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_push_body_shape() {
        let event: Event =
            serde_json::from_value(json!({ "event": "order", "data": { "n": 3 } })).unwrap();
        assert_eq!(event.event_type, "order");
        assert_eq!(event.data, json!({ "n": 3 }));
        assert!(event.id.is_empty());

        let event: Event = serde_json::from_value(json!({ "event": "order" })).unwrap();
        assert_eq!(event.validate(), Err(InvalidEvent::MissingData));
    }

    #[test]
    fn test_from_record_rejects_invalid_json() {
        assert!(Event::from_record("1", "message", "{not json").is_err());
        let event = Event::from_record("1", "message", "[1,2]").unwrap();
        assert_eq!(event.data, json!([1, 2]));
    }

    #[test]
    fn test_close_event() {
        let event = Event::close();
        assert!(event.is_close());
        assert!(event.validate().is_ok());
    }
}
