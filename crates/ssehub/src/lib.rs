//! ssehub - server-push event broker.
//!
//! Keeps one long-lived `text/event-stream` connection per client identifier
//! and fans pushed events out to them, with replay on reconnect and
//! bounded retry when a queue is saturated.

pub mod api;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod hub;
pub mod pool;
pub mod registry;
pub mod stats;
pub mod store;

pub use client::{StreamRequest, StreamWriter, UserClient};
pub use config::{AppConfig, HubConfig};
pub use consumer::{
    Backoff, Consumer, ConsumerConfig, ConsumerError, ConsumerState, TransportErrorKind,
};
pub use error::{HubError, ServeError};
pub use hub::{Hub, HubBuilder};
pub use ssehub_protocol::{Event, UserEvent};
pub use stats::{PushStats, PushStatsSnapshot};
pub use store::{EventPage, MemoryStore, SqliteStore, Store, StoreError};
