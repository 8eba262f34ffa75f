//! Per-connection client state and the serve loop.
//!
//! Each streaming request gets one [`UserClient`], registered with the hub for
//! as long as its [`Session`] runs. The session multiplexes the client's
//! outbound queue, an idle heartbeat timer and cancellation onto the
//! response body.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use ssehub_protocol::{DEFAULT_EVENT_TYPE, Event, frame};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ServeError, WriteError};
use crate::hub::Hub;

/// Records buffered between the serve loop and the HTTP body.
const WRITER_BUFFER: usize = 16;

/// An item in a client's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(Event),
    Heartbeat,
}

// ============================================================================
// StreamWriter
// ============================================================================

/// Write half of a streaming response body.
///
/// Each write hands one complete record to the body, which the HTTP layer
/// flushes as its own chunk.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
}

/// Read half of a streaming response body.
pub type BodyStream = ReceiverStream<Result<Bytes, Infallible>>;

impl StreamWriter {
    /// Create a writer and the stream feeding the response body.
    pub fn channel() -> (Self, BodyStream) {
        let (tx, rx) = mpsc::channel(WRITER_BUFFER);
        (Self { tx }, ReceiverStream::new(rx))
    }

    pub async fn write(&self, record: Bytes) -> Result<(), WriteError> {
        self.tx.send(Ok(record)).await.map_err(|_| WriteError)
    }

    /// Resolves once the body has been dropped by the peer side.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// UserClient
// ============================================================================

/// The one active connection for an identifier.
#[derive(Debug)]
pub struct UserClient {
    identifier: String,
    connection_id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    writer: StreamWriter,
    close_sent: AtomicBool,
    shutdown: CancellationToken,
}

impl UserClient {
    /// Create a client with an outbound queue of `buffer_size` items.
    ///
    /// Cancelling `shutdown` (or calling [`UserClient::disconnect`]) ends the
    /// client's serve loop.
    pub fn new(
        identifier: impl Into<String>,
        buffer_size: usize,
        writer: StreamWriter,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let client = Self {
            identifier: identifier.into(),
            connection_id: Uuid::new_v4(),
            outbound: tx,
            writer,
            close_sent: AtomicBool::new(false),
            shutdown,
        };
        (Arc::new(client), rx)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &UserClient) -> bool {
        self.connection_id == other.connection_id
    }

    /// Non-blocking enqueue.
    pub fn try_send(&self, item: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.outbound.try_send(item)
    }

    /// Enqueue, waiting at most `timeout` for space.
    pub async fn send_timeout(
        &self,
        item: Outbound,
        timeout: Duration,
    ) -> Result<(), SendTimeoutError<Outbound>> {
        self.outbound.send_timeout(item, timeout).await
    }

    /// Whether a `close` record has been written to this connection.
    pub fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    fn mark_close_sent(&self) {
        self.close_sent.store(true, Ordering::Release);
    }

    /// End the connection's serve loop. Idempotent.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.shutdown.is_cancelled() || self.writer.is_closed()
    }

    /// Resolves when the connection is cancelled or the peer goes away.
    async fn cancelled(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.writer.closed() => {}
        }
    }
}

// ============================================================================
// StreamRequest
// ============================================================================

/// What a connecting client asked for.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub identifier: Option<String>,
    pub event_type: Option<String>,
    pub last_event_id: Option<String>,
}

impl StreamRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::default()
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_last_event_id(mut self, last_event_id: impl Into<String>) -> Self {
        self.last_event_id = Some(last_event_id.into());
        self
    }

    /// The required, non-empty identifier.
    pub fn identifier(&self) -> Result<&str, ServeError> {
        self.identifier
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ServeError::MissingIdentifier)
    }

    fn replay_event_type(&self) -> &str {
        self.event_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_EVENT_TYPE)
    }

    fn replay_from(&self) -> Option<&str> {
        self.last_event_id.as_deref().filter(|id| !id.is_empty())
    }
}

// ============================================================================
// Session
// ============================================================================

/// A registered connection and its serve loop.
pub struct Session {
    hub: Hub,
    client: Arc<UserClient>,
    outbound: mpsc::Receiver<Outbound>,
    request: StreamRequest,
    released: bool,
}

impl Session {
    /// Validate the request and register a new client with the hub.
    ///
    /// `cancel` follows the underlying request; cancelling it ends the loop.
    pub async fn open(
        hub: &Hub,
        request: StreamRequest,
        writer: StreamWriter,
        cancel: &CancellationToken,
    ) -> Result<Self, ServeError> {
        let identifier = request.identifier()?.to_string();
        let (client, outbound) = UserClient::new(
            identifier,
            hub.config().buffer_size,
            writer,
            cancel.child_token(),
        );
        hub.register(client.clone()).await?;

        Ok(Self {
            hub: hub.clone(),
            client,
            outbound,
            request,
            released: false,
        })
    }

    pub fn client(&self) -> &Arc<UserClient> {
        &self.client
    }

    /// Stream until cancellation, peer disconnect or a write failure, then
    /// unregister.
    pub async fn run(mut self) -> Result<(), ServeError> {
        let result = self.stream().await;
        match &result {
            Ok(()) => debug!("Stream for {} ended", self.client.identifier()),
            Err(err) => debug!("Stream for {} ended: {}", self.client.identifier(), err),
        }

        self.released = true;
        self.hub.unregister(&self.client).await;
        result
    }

    async fn stream(&mut self) -> Result<(), ServeError> {
        let interval = self.hub.config().heartbeat_interval();

        // Lets the caller tell "connected" apart from "still negotiating".
        self.client.writer.write(frame::heartbeat()).await?;

        let mut replayed = match (self.hub.resend_enabled(), self.request.replay_from()) {
            (true, Some(last_id)) => self.replay(last_id).await?,
            _ => HashSet::new(),
        };

        let idle = tokio::time::sleep(interval);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                item = self.outbound.recv() => {
                    let Some(item) = item else {
                        return Ok(());
                    };
                    match item {
                        Outbound::Heartbeat => self.client.writer.write(frame::heartbeat()).await?,
                        Outbound::Event(event) => {
                            if !replayed.is_empty() && replayed.remove(&event.id) {
                                debug!(
                                    "Skipping event {} for {}: already replayed",
                                    event.id,
                                    self.client.identifier()
                                );
                                continue;
                            }
                            self.write_event(&event).await?;
                        }
                    }
                    idle.as_mut().reset(Instant::now() + interval);
                }
                _ = &mut idle => {
                    self.client.writer.write(frame::heartbeat()).await?;
                    idle.as_mut().reset(Instant::now() + interval);
                }
                _ = self.client.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    async fn write_event(&self, event: &Event) -> Result<(), ServeError> {
        let stats = self.hub.stats();
        let record = match frame::encode(event) {
            Ok(record) => record,
            Err(err) => {
                warn!("Failed to frame event {}: {}", event.id, err);
                stats.record_failed();
                return Ok(());
            }
        };

        match self.client.writer.write(record).await {
            Ok(()) => {
                stats.record_success();
                if event.is_close() {
                    self.client.mark_close_sent();
                }
                Ok(())
            }
            Err(err) => {
                stats.record_failed();
                Err(err.into())
            }
        }
    }

    /// Write every stored event after `last_id`, page by page.
    ///
    /// Returns the ids written so live copies of them can be skipped.
    async fn replay(&self, last_id: &str) -> Result<HashSet<String>, ServeError> {
        let mut replayed = HashSet::new();
        let Some(store) = self.hub.store() else {
            return Ok(replayed);
        };

        let event_type = self.request.replay_event_type();
        let page_size = self.hub.config().replay_page_size;
        let mut cursor = last_id.to_string();

        loop {
            let page = match store.list_by_last_id(event_type, &cursor, page_size).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        "Replay for {} stopped after {} events: {}",
                        self.client.identifier(),
                        replayed.len(),
                        err
                    );
                    break;
                }
            };

            for event in &page.events {
                match frame::encode(event) {
                    Ok(record) => self.client.writer.write(record).await?,
                    Err(err) => {
                        warn!("Skipping unframeable stored event {}: {}", event.id, err);
                        continue;
                    }
                }
                if event.is_close() {
                    self.client.mark_close_sent();
                }
                replayed.insert(event.id.clone());
            }

            if page.is_exhausted() {
                break;
            }
            cursor = page.next_id;
        }

        info!(
            "Replayed {} '{}' events to {} after {}",
            replayed.len(),
            event_type,
            self.client.identifier(),
            last_id
        );
        Ok(replayed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped without finishing `run`; unregister in the background.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            let client = self.client.clone();
            runtime.spawn(async move { hub.unregister(&client).await });
        } else {
            self.client.disconnect();
        }
    }
}

/// Serve one streaming connection from registration to unregistration.
pub async fn serve(
    hub: &Hub,
    request: StreamRequest,
    writer: StreamWriter,
    cancel: &CancellationToken,
) -> Result<(), ServeError> {
    Session::open(hub, request, writer, cancel).await?.run().await
}
