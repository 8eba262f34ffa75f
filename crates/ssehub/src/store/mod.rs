//! Event persistence for replay-on-reconnect.
//!
//! A store is an append-only log per event type. Readers page through it by
//! the id of the last event they saw.

mod memory;
mod sqlite;

use async_trait::async_trait;
use ssehub_protocol::Event;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("failed to encode event data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One page of a replay read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    /// Events strictly after the requested id, in append order.
    pub events: Vec<Event>,
    /// Id to resume from for the next page; empty when the log is exhausted.
    pub next_id: String,
}

impl EventPage {
    pub fn is_exhausted(&self) -> bool {
        self.next_id.is_empty()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Append an event to its type's log.
    async fn save(&self, event: &Event) -> Result<(), StoreError>;

    /// Read up to `page_size` events of `event_type` appended after `last_id`.
    ///
    /// An empty `last_id` reads from the start. An id the log does not
    /// contain yields an empty, exhausted page.
    async fn list_by_last_id(
        &self,
        event_type: &str,
        last_id: &str,
        page_size: usize,
    ) -> Result<EventPage, StoreError>;
}
