//! Broker error types.

use ssehub_protocol::InvalidEvent;
use thiserror::Error;

use crate::store::StoreError;

/// Errors returned synchronously by [`crate::Hub`] operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("no events to push")]
    EmptyEvents,

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] InvalidEvent),

    #[error("failed to persist event {id}: {source}")]
    Persist {
        id: String,
        #[source]
        source: StoreError,
    },

    #[error("hub is closed")]
    Closed,
}

/// Errors ending a stream connection.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("client identifier is required")]
    MissingIdentifier,

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("connection closed by peer")]
    Disconnected,
}

/// The peer went away while a record was being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream receiver dropped")]
pub struct WriteError;

impl From<WriteError> for ServeError {
    fn from(_: WriteError) -> Self {
        ServeError::Disconnected
    }
}
