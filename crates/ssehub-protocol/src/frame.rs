//! Record framing for `text/event-stream` responses.
//!
//! An event is written as
//!
//! ```text
//! id: <id>
//! event: <type>
//! data: <json>
//!
//! ```
//!
//! and a heartbeat as the comment line `: heartbeat` followed by a blank line.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Event;

/// Heartbeat comment record.
pub const HEARTBEAT: &[u8] = b": heartbeat\n\n";

/// Frame an event into a single wire record.
///
/// The payload is compact JSON, so it never spans more than one `data:` line.
pub fn encode(event: &Event) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(&event.data)?;

    let mut buf =
        BytesMut::with_capacity(event.id.len() + event.event_type.len() + data.len() + 24);
    buf.put_slice(b"id: ");
    buf.put_slice(event.id.as_bytes());
    buf.put_slice(b"\nevent: ");
    buf.put_slice(event.event_type.as_bytes());
    buf.put_slice(b"\ndata: ");
    buf.put_slice(data.as_bytes());
    buf.put_slice(b"\n\n");

    Ok(buf.freeze())
}

/// The heartbeat record.
pub fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT)
}
