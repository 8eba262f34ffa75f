//! Reconnecting event-stream consumer.
//!
//! [`Consumer`] keeps one stream open against a broker, dispatches parsed
//! events to per-type handlers and reconnects with exponential backoff,
//! resuming from the last id it received. A `close` event ends it without
//! retrying, as does [`Consumer::disconnect`] or running out of attempts.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> ReconnectWait -> Connecting -> ...
//!                                                          \-> Terminated
//! ```

mod backoff;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_eventsource::{Event as SourceEvent, EventSource, retry};
use ssehub_protocol::{CLOSE_EVENT, DEFAULT_EVENT_TYPE, Event, HEADER_LAST_EVENT_ID};
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;

pub use backoff::Backoff;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer is already connected")]
    AlreadyConnected,

    #[error("consumer has been terminated")]
    Terminated,

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to open event stream: {0}")]
    Request(#[from] reqwest_eventsource::CannotCloneRequestError),
}

/// Why a connection attempt or an open stream failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connecting or reading timed out.
    Timeout,
    /// Nothing accepted the connection.
    Refused,
    /// The server answered with a non-success status.
    Status(u16),
    /// The server ended the stream.
    Ended,
    /// Anything else: bad content type, malformed stream, body errors.
    Protocol,
}

impl TransportErrorKind {
    pub fn classify(err: &reqwest_eventsource::Error) -> Self {
        use reqwest_eventsource::Error;

        match err {
            Error::Transport(e) if e.is_timeout() => Self::Timeout,
            Error::Transport(e) if e.is_connect() => Self::Refused,
            Error::InvalidStatusCode(status, _) => Self::Status(status.as_u16()),
            Error::StreamEnded => Self::Ended,
            _ => Self::Protocol,
        }
    }

    /// The broker could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Refused)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Refused => write!(f, "connection refused"),
            Self::Status(code) => write!(f, "status {code}"),
            Self::Ended => write!(f, "stream ended"),
            Self::Protocol => write!(f, "protocol error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Streaming,
    ReconnectWait,
    Terminated,
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    /// Type given to records that carry no `event:` field.
    pub default_event_type: String,
    pub connect_timeout: Duration,
    /// Resume point for the first connection.
    pub last_event_id: Option<String>,
}

impl ConsumerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_retries: DEFAULT_MAX_RETRIES,
            default_event_type: DEFAULT_EVENT_TYPE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            last_event_id: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn initial_backoff(mut self, interval: Duration) -> Self {
        self.initial_backoff = interval;
        self
    }

    pub fn max_backoff(mut self, interval: Duration) -> Self {
        self.max_backoff = interval;
        self
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts;
        self
    }

    pub fn default_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.default_event_type = event_type.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }

    fn header_map(&self) -> Result<HeaderMap, ConsumerError> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConsumerError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| ConsumerError::InvalidHeader(name.clone()))?;
            map.insert(header, value);
        }
        Ok(map)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff, self.max_retries)
    }
}

// ============================================================================
// Consumer
// ============================================================================

type Handler = Arc<dyn Fn(Event) + Send + Sync>;

struct Inner {
    config: ConsumerConfig,
    headers: HeaderMap,
    http: reqwest::Client,
    handlers: DashMap<String, Handler>,
    state: watch::Sender<ConsumerState>,
    attempts: AtomicU32,
    last_event_id: RwLock<Option<String>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    done: CancellationToken,
}

enum Outcome {
    /// Disconnected locally or told to close by the server.
    Finished,
    Failed(TransportErrorKind),
}

/// Client side of a broker stream. Cheap to clone.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig) -> Result<Self, ConsumerError> {
        let headers = config.header_map()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        let (state, _) = watch::channel(ConsumerState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                last_event_id: RwLock::new(config.last_event_id.clone()),
                config,
                headers,
                http,
                handlers: DashMap::new(),
                state,
                attempts: AtomicU32::new(0),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        })
    }

    /// Register the handler for one event type, replacing any previous one.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.inner.handlers.insert(event_type.into(), Arc::new(handler));
    }

    /// Start the connect loop in the background.
    pub fn connect(&self) -> Result<(), ConsumerError> {
        if self.inner.shutdown.is_cancelled() || self.state() == ConsumerState::Terminated {
            return Err(ConsumerError::Terminated);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyConnected);
        }

        tokio::spawn(run(self.inner.clone()));
        Ok(())
    }

    /// Stop for good. The consumer cannot be connected again.
    pub fn disconnect(&self) {
        self.inner.shutdown.cancel();
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            self.inner.terminate();
        }
    }

    /// Resolves once the consumer has terminated.
    pub async fn wait(&self) {
        self.inner.done.cancelled().await
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConsumerState::Streaming
    }

    /// Connections attempted so far, including the first.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    pub async fn last_event_id(&self) -> Option<String> {
        self.inner.last_event_id.read().await.clone()
    }
}

impl Inner {
    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    fn terminate(&self) {
        self.set_state(ConsumerState::Terminated);
        self.done.cancel();
    }

    async fn stream_once(&self, backoff: &mut Backoff) -> Result<Outcome, ConsumerError> {
        let mut request = self
            .http
            .get(&self.config.url)
            .headers(self.headers.clone())
            .header(reqwest::header::ACCEPT, ssehub_protocol::CONTENT_TYPE_EVENT_STREAM);
        if let Some(id) = self.last_event_id.read().await.as_deref() {
            request = request.header(HEADER_LAST_EVENT_ID, id);
        }

        let mut source = EventSource::new(request)?;
        source.set_retry_policy(Box::new(retry::Never));

        while let Some(item) = source.next().await {
            match item {
                Ok(SourceEvent::Open) => {
                    self.set_state(ConsumerState::Streaming);
                    backoff.reset();
                    info!("Connected to {}", self.config.url);
                }
                Ok(SourceEvent::Message(message)) => {
                    if !message.id.is_empty() {
                        *self.last_event_id.write().await = Some(message.id.clone());
                    }
                    let event_type = if message.event.is_empty() {
                        self.config.default_event_type.clone()
                    } else {
                        message.event
                    };

                    if event_type == CLOSE_EVENT {
                        info!("Server at {} closed the stream", self.config.url);
                        source.close();
                        return Ok(Outcome::Finished);
                    }
                    self.dispatch(message.id, event_type, &message.data);
                }
                Err(err) => {
                    let kind = TransportErrorKind::classify(&err);
                    source.close();
                    if kind == TransportErrorKind::Ended {
                        debug!("Stream from {} ended", self.config.url);
                    } else {
                        warn!("Stream from {} failed ({}): {}", self.config.url, kind, err);
                    }
                    return Ok(Outcome::Failed(kind));
                }
            }
        }
        Ok(Outcome::Failed(TransportErrorKind::Ended))
    }

    fn dispatch(&self, id: String, event_type: String, data: &str) {
        let event = match Event::from_record(id, event_type, data) {
            Ok(event) => event,
            Err(err) => {
                warn!("Skipping malformed record from {}: {}", self.config.url, err);
                return;
            }
        };

        // Clone out of the map so handlers may register other handlers.
        let handler = self.handlers.get(&event.event_type).map(|h| h.value().clone());
        match handler {
            Some(handler) => handler(event),
            None => debug!("No handler for '{}' event {}", event.event_type, event.id),
        }
    }
}

async fn run(inner: Arc<Inner>) {
    let mut backoff = inner.config.backoff();

    while !inner.shutdown.is_cancelled() {
        inner.attempts.fetch_add(1, Ordering::AcqRel);
        inner.set_state(ConsumerState::Connecting);
        debug!("Connecting to {} (attempt {})", inner.config.url, backoff.attempts() + 1);

        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            outcome = inner.stream_once(&mut backoff) => outcome,
        };

        let kind = match outcome {
            Ok(Outcome::Finished) => break,
            Ok(Outcome::Failed(kind)) => kind,
            Err(err) => {
                error!("Cannot stream from {}: {}", inner.config.url, err);
                break;
            }
        };

        let Some(delay) = backoff.record_failure() else {
            warn!(
                "Giving up on {} after {} failed connections ({})",
                inner.config.url,
                backoff.attempts(),
                kind
            );
            break;
        };

        inner.set_state(ConsumerState::ReconnectWait);
        info!("Reconnecting to {} in {:?}", inner.config.url, delay);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.terminate();
    debug!("Consumer for {} terminated", inner.config.url);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConsumerConfig::new("http://localhost:8686/events");
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.default_event_type, "message");
        assert!(config.last_event_id.is_none());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let config = ConsumerConfig::new("http://localhost/").header("bad header", "x");
        assert!(matches!(
            Consumer::new(config),
            Err(ConsumerError::InvalidHeader(name)) if name == "bad header"
        ));
    }

    #[test]
    fn test_unreachable_kinds() {
        assert!(TransportErrorKind::Timeout.is_unreachable());
        assert!(TransportErrorKind::Refused.is_unreachable());
        assert!(!TransportErrorKind::Status(502).is_unreachable());
        assert_eq!(TransportErrorKind::Status(502).to_string(), "status 502");
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_terminal() {
        let consumer = Consumer::new(ConsumerConfig::new("http://127.0.0.1:1/")).unwrap();
        assert_eq!(consumer.state(), ConsumerState::Disconnected);

        consumer.disconnect();
        tokio::time::timeout(Duration::from_secs(1), consumer.wait())
            .await
            .expect("wait should resolve after disconnect");
        assert_eq!(consumer.state(), ConsumerState::Terminated);
        assert!(matches!(consumer.connect(), Err(ConsumerError::Terminated)));
        assert_eq!(consumer.attempts(), 0);
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let config = ConsumerConfig::new("http://127.0.0.1:1/")
            .initial_backoff(Duration::from_secs(5))
            .max_retries(3);
        let consumer = Consumer::new(config).unwrap();

        consumer.connect().unwrap();
        assert!(matches!(
            consumer.connect(),
            Err(ConsumerError::AlreadyConnected)
        ));

        consumer.disconnect();
        tokio::time::timeout(Duration::from_secs(2), consumer.wait())
            .await
            .expect("disconnect should stop the loop");
        assert!(!consumer.is_connected());
    }
}
