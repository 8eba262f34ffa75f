//! Wire protocol for the ssehub event broker.
//!
//! Shared by the broker (which frames events onto `text/event-stream`
//! responses) and the consumer client (which parses them back).

pub mod event;
pub mod frame;
pub mod id;

pub use event::{Event, InvalidEvent, UserEvent};
pub use id::next_id;

/// Event type telling a consumer to stop and not reconnect.
pub const CLOSE_EVENT: &str = "close";

/// Event type assumed for records that carry no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Content type of the streaming response.
pub const CONTENT_TYPE_EVENT_STREAM: &str = "text/event-stream";

/// Header carrying the last event id a reconnecting client received.
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";

/// Header naming the event type a client wants replayed.
pub const HEADER_EVENT_TYPE: &str = "Event-Type";

/// Query parameter equivalent of [`HEADER_LAST_EVENT_ID`].
pub const QUERY_LAST_EVENT_ID: &str = "last_event_id";

/// Query parameter equivalent of [`HEADER_EVENT_TYPE`].
pub const QUERY_EVENT_TYPE: &str = "event_type";
