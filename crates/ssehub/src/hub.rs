//! The broker.
//!
//! A [`Hub`] owns the client registry, the retry pool and the push counters.
//! All registry mutations go through one control loop task fed by three
//! bounded queues (register, unregister, deliver); producers only read the
//! registry.
//!
//! Delivery is two-tier: a non-blocking enqueue first, and when a queue is
//! full the attempt is handed to the [`TaskPool`], which retries it with a
//! per-attempt deadline and reports exhaustion through the stats and the
//! optional failure callback.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use ssehub_protocol::{Event, UserEvent};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{Outbound, UserClient};
use crate::config::HubConfig;
use crate::error::HubError;
use crate::pool::TaskPool;
use crate::registry::ClientRegistry;
use crate::stats::{PushStats, PushStatsSnapshot};
use crate::store::Store;

/// Capacity of the register and unregister queues.
const MEMBERSHIP_QUEUE_SIZE: usize = 64;

/// Called with `(identifier, event)` when a delivery is given up.
pub type FailureCallback = Arc<dyn Fn(&str, &Event) + Send + Sync>;

/// State shared between the hub handle, its control loop and retry jobs.
struct Shared {
    config: HubConfig,
    registry: ClientRegistry,
    stats: PushStats,
    pool: TaskPool,
    on_failure: Option<FailureCallback>,
}

impl Shared {
    fn give_up(&self, identifier: &str, event: &Event) {
        self.stats.record_failed();
        warn!("Giving up on event {} for {}", event.id, identifier);
        if let Some(callback) = &self.on_failure {
            callback(identifier, event);
        }
    }

    fn admit(&self, client: Arc<UserClient>) {
        let identifier = client.identifier().to_string();
        if let Some(stale) = self.registry.set(identifier.clone(), client.clone())
            && !stale.same_connection(&client)
        {
            info!("Replacing stale connection for {}", identifier);
            stale.disconnect();
        }
        debug!(
            "Registered {} ({} online)",
            identifier,
            self.registry.len()
        );
    }

    fn remove(&self, client: &UserClient) {
        let removed = self
            .registry
            .delete_if(client.identifier(), |current| current.same_connection(client));
        if removed.is_some() {
            debug!(
                "Unregistered {} ({} online)",
                client.identifier(),
                self.registry.len()
            );
        }
        client.disconnect();
    }
}

struct Membership {
    client: Arc<UserClient>,
    ack: oneshot::Sender<()>,
}

/// Where a slow-path retry sends to.
enum RetryTarget {
    /// The hub's delivery queue (push fast path was full).
    Delivery(mpsc::Sender<UserEvent>),
    /// A client's outbound queue (control loop found it full).
    Client(Arc<UserClient>),
}

enum AttemptError {
    Timeout,
    Closed,
}

impl RetryTarget {
    async fn send(&self, user_event: &UserEvent, shared: &Shared) -> Result<(), AttemptError> {
        let timeout = shared.config.retry_timeout();
        let result = match self {
            RetryTarget::Delivery(tx) => tx
                .send_timeout(user_event.clone(), timeout)
                .await
                .map_err(|err| matches!(err, SendTimeoutError::Timeout(_))),
            RetryTarget::Client(client) => client
                .send_timeout(Outbound::Event(user_event.event.clone()), timeout)
                .await
                .map_err(|err| matches!(err, SendTimeoutError::Timeout(_))),
        };
        result.map_err(|timed_out| {
            if timed_out {
                AttemptError::Timeout
            } else {
                AttemptError::Closed
            }
        })
    }
}

/// Bounded retry run inside a pool worker.
async fn retry_delivery(shared: Arc<Shared>, target: RetryTarget, user_event: UserEvent) {
    let attempts = shared.config.retry_attempts.max(1);
    for attempt in 1..=attempts {
        match target.send(&user_event, &shared).await {
            Ok(()) => {
                debug!(
                    "Delivered event {} to {} on retry {}",
                    user_event.event.id, user_event.identifier, attempt
                );
                return;
            }
            Err(AttemptError::Timeout) => {
                shared.stats.record_timeout();
                debug!(
                    "Retry {}/{} for event {} to {} timed out",
                    attempt, attempts, user_event.event.id, user_event.identifier
                );
            }
            Err(AttemptError::Closed) => break,
        }
    }
    shared.give_up(&user_event.identifier, &user_event.event);
}

/// Hand a saturated delivery to the retry pool, waiting for pool capacity.
async fn submit_retry(shared: &Arc<Shared>, target: RetryTarget, user_event: UserEvent) {
    let job = retry_delivery(shared.clone(), target, user_event.clone());
    if let Err(err) = shared.pool.submit(job).await {
        debug!("Retry for event {} not scheduled: {}", user_event.event.id, err);
        shared.give_up(&user_event.identifier, &user_event.event);
    }
}

/// Like [`submit_retry`], but a saturated pool gives the delivery up instead
/// of waiting. Used by the control loop, which must never block.
fn try_submit_retry(shared: &Arc<Shared>, target: RetryTarget, user_event: UserEvent) {
    let job = retry_delivery(shared.clone(), target, user_event.clone());
    if let Err(err) = shared.pool.try_submit(job) {
        debug!("Retry for event {} not scheduled: {}", user_event.event.id, err);
        shared.give_up(&user_event.identifier, &user_event.event);
    }
}

async fn control_loop(
    shared: Arc<Shared>,
    lifetime: CancellationToken,
    mut register_rx: mpsc::Receiver<Membership>,
    mut unregister_rx: mpsc::Receiver<Membership>,
    mut deliver_rx: mpsc::Receiver<UserEvent>,
) {
    debug!("Hub control loop started");
    loop {
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => break,
            Some(membership) = register_rx.recv() => {
                shared.admit(membership.client);
                let _ = membership.ack.send(());
            }
            Some(membership) = unregister_rx.recv() => {
                shared.remove(&membership.client);
                let _ = membership.ack.send(());
            }
            Some(user_event) = deliver_rx.recv() => deliver(&shared, user_event),
            else => break,
        }
    }
    debug!("Hub control loop stopped");
}

fn deliver(shared: &Arc<Shared>, user_event: UserEvent) {
    let Some(client) = shared.registry.get(&user_event.identifier) else {
        debug!(
            "Dropping event {} for {}: not connected",
            user_event.event.id, user_event.identifier
        );
        return;
    };

    match client.try_send(Outbound::Event(user_event.event.clone())) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!(
                "Outbound queue for {} is full, retrying event {} in the background",
                user_event.identifier, user_event.event.id
            );
            try_submit_retry(shared, RetryTarget::Client(client), user_event);
        }
        Err(TrySendError::Closed(_)) => {
            shared.give_up(&user_event.identifier, &user_event.event);
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

struct HubInner {
    shared: Arc<Shared>,
    store: Option<Arc<dyn Store>>,
    register_tx: mpsc::Sender<Membership>,
    unregister_tx: mpsc::Sender<Membership>,
    deliver_tx: mpsc::Sender<UserEvent>,
    lifetime: CancellationToken,
    control: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Handle to a running broker. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Configures and starts a [`Hub`].
#[derive(Default)]
pub struct HubBuilder {
    config: HubConfig,
    store: Option<Arc<dyn Store>>,
    on_push_failure: Option<FailureCallback>,
}

impl HubBuilder {
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist pushed events so reconnecting clients can be replayed.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn maybe_store(mut self, store: Option<Arc<dyn Store>>) -> Self {
        self.store = store;
        self
    }

    /// Called once for every delivery that is given up.
    pub fn on_push_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.on_push_failure = Some(Arc::new(callback));
        self
    }

    /// Start the control loop and retry pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Hub {
        let config = self.config;
        let (register_tx, register_rx) = mpsc::channel(MEMBERSHIP_QUEUE_SIZE);
        let (unregister_tx, unregister_rx) = mpsc::channel(MEMBERSHIP_QUEUE_SIZE);
        let (deliver_tx, deliver_rx) = mpsc::channel(config.delivery_queue_size.max(1));

        let shared = Arc::new(Shared {
            pool: TaskPool::new(config.workers, config.pool_queue_size),
            registry: ClientRegistry::new(),
            stats: PushStats::new(),
            on_failure: self.on_push_failure,
            config,
        });

        let lifetime = CancellationToken::new();
        let handle = tokio::spawn(control_loop(
            shared.clone(),
            lifetime.clone(),
            register_rx,
            unregister_rx,
            deliver_rx,
        ));

        info!(
            "Hub started (workers={}, buffer_size={}, resend={}, store={})",
            shared.config.workers,
            shared.config.buffer_size,
            shared.config.resend,
            self.store.is_some()
        );

        Hub {
            inner: Arc::new(HubInner {
                shared,
                store: self.store,
                register_tx,
                unregister_tx,
                deliver_tx,
                lifetime,
                control: Mutex::new(Some(handle)),
                closing: AtomicBool::new(false),
            }),
        }
    }
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::default()
    }

    /// Start a hub with `config` and no store.
    pub fn new(config: HubConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.shared.config
    }

    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.inner.store.as_ref()
    }

    /// Whether reconnecting clients are replayed from the store.
    pub fn resend_enabled(&self) -> bool {
        self.inner.shared.config.resend && self.inner.store.is_some()
    }

    pub fn stats(&self) -> &PushStats {
        &self.inner.shared.stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifetime.is_cancelled()
    }

    /// Push `events` to `identifiers`, or to every connected client when
    /// `identifiers` is empty.
    ///
    /// All events are validated before anything is persisted or enqueued.
    /// Targets that are not connected are skipped. A store failure skips only
    /// that event; the first such failure is returned after the remaining
    /// events have been pushed.
    pub async fn push(&self, identifiers: &[String], events: Vec<Event>) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        if events.is_empty() {
            return Err(HubError::EmptyEvents);
        }
        for event in &events {
            event.validate()?;
        }

        let mut first_error = None;
        for mut event in events {
            event.ensure_id();

            if let Some(store) = &self.inner.store
                && let Err(source) = store.save(&event).await
            {
                warn!("Failed to persist event {}: {}", event.id, source);
                first_error.get_or_insert(HubError::Persist {
                    id: event.id.clone(),
                    source,
                });
                continue;
            }

            self.fan_out(identifiers, &event).await;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fan_out(&self, identifiers: &[String], event: &Event) {
        for identifier in self.targets(identifiers) {
            self.inner.shared.stats.record_total();
            self.dispatch(UserEvent::new(identifier, event.clone())).await;
        }
    }

    fn targets(&self, identifiers: &[String]) -> Vec<String> {
        let registry = &self.inner.shared.registry;
        if identifiers.is_empty() {
            return registry.keys();
        }

        let mut seen = HashSet::new();
        identifiers
            .iter()
            .filter(|id| seen.insert(id.as_str()) && registry.has(id))
            .cloned()
            .collect()
    }

    async fn dispatch(&self, user_event: UserEvent) {
        match self.inner.deliver_tx.try_send(user_event) {
            Ok(()) => {}
            Err(TrySendError::Full(user_event)) => {
                let target = RetryTarget::Delivery(self.inner.deliver_tx.clone());
                submit_retry(&self.inner.shared, target, user_event).await;
            }
            Err(TrySendError::Closed(user_event)) => {
                self.inner
                    .shared
                    .give_up(&user_event.identifier, &user_event.event);
            }
        }
    }

    /// Queue a heartbeat comment for one client. Returns whether it was queued.
    pub fn push_heartbeat(&self, identifier: &str) -> bool {
        match self.inner.shared.registry.get(identifier) {
            Some(client) => client.try_send(Outbound::Heartbeat).is_ok(),
            None => false,
        }
    }

    pub fn online_clients_num(&self) -> usize {
        self.inner.shared.registry.len()
    }

    pub fn push_stats(&self) -> PushStatsSnapshot {
        self.inner.shared.stats.snapshot()
    }

    pub fn print_push_stats(&self) {
        info!(
            "Push stats: {} online={}",
            self.push_stats(),
            self.online_clients_num()
        );
    }

    /// Admit a client, superseding any previous connection for its identifier.
    pub async fn register(&self, client: Arc<UserClient>) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let (ack, done) = oneshot::channel();
        self.inner
            .register_tx
            .send(Membership { client, ack })
            .await
            .map_err(|_| HubError::Closed)?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Remove a client if it is still the registered connection for its
    /// identifier, and end its serve loop.
    pub async fn unregister(&self, client: &Arc<UserClient>) {
        let (ack, done) = oneshot::channel();
        let membership = Membership {
            client: client.clone(),
            ack,
        };
        let acknowledged = match self.inner.unregister_tx.send(membership).await {
            Ok(()) => done.await.is_ok(),
            Err(_) => false,
        };
        if !acknowledged {
            // Control loop is gone; nothing else mutates the registry now.
            self.inner.shared.remove(client);
        }
    }

    /// Shut the broker down. Only the first call has an effect.
    ///
    /// Unless `try_to_reconnect` is set or notification is disabled, a
    /// `close` event is broadcast first and clients that have written it are
    /// removed as they acknowledge, for up to the configured wait. Then the
    /// control loop stops, outstanding retries finish and remaining clients
    /// are disconnected.
    pub async fn close(&self, try_to_reconnect: bool) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            debug!("Hub is already closing");
            return;
        }

        let shared = &self.inner.shared;
        if !shared.registry.is_empty() && shared.config.notify_on_close && !try_to_reconnect {
            info!("Notifying {} clients of shutdown", shared.registry.len());
            let mut close = Event::close();
            close.ensure_id();
            self.fan_out(&[], &close).await;
            self.drain_acknowledged().await;
        }

        self.inner.lifetime.cancel();
        let handle = self.inner.control.lock().await.take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!("Hub control loop ended abnormally: {}", err);
        }

        shared.pool.wait().await;
        shared.pool.stop().await;

        for client in shared.registry.values() {
            client.disconnect();
        }
        shared.registry.clear();
        info!("Hub closed: {}", shared.stats.snapshot());
    }

    async fn drain_acknowledged(&self) {
        let registry = &self.inner.shared.registry;
        let deadline = Instant::now() + self.inner.shared.config.close_wait();
        let mut poll = tokio::time::interval(self.inner.shared.config.close_poll());

        loop {
            poll.tick().await;
            for client in registry.values() {
                if client.close_sent() {
                    self.unregister(&client).await;
                }
            }
            if registry.is_empty() {
                debug!("All clients acknowledged shutdown");
                return;
            }
            if Instant::now() >= deadline {
                info!(
                    "{} clients did not acknowledge shutdown in time",
                    registry.len()
                );
                return;
            }
        }
    }
}
