//! Shared watch connections, one per (client, namespace), fanned out to subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use rustc_hash::FxHashMap;
use skerry_core::{is_older_version, Config, Error, Result, WatchEvent};
use skerry_kubehub::{ClientId, ResourceApiClient, WatchFrame, WatchStream};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::lock;

/// Something that consumes batches from a shared watch connection.
#[async_trait::async_trait]
pub trait WatchSubscriber: Send + Sync + 'static {
    fn client(&self) -> Arc<ResourceApiClient>;
    /// Where the connection for `namespace` should resume; `None` forces a resync first.
    fn resume_version(&self, namespace: Option<&str>) -> Option<String>;
    fn deliver(&self, namespace: Option<&str>, events: &[WatchEvent], bookmark: Option<&str>);
    async fn resync(self: Arc<Self>) -> Result<()>;
    fn watch_failed(&self, namespace: Option<&str>, error: &Error);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub client: ClientId,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Error,
    Backoff,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub batch_window: Duration,
}

impl From<&Config> for WatchConfig {
    fn from(c: &Config) -> Self {
        Self { backoff_base: c.watch_backoff_base, backoff_max: c.watch_backoff_max, batch_window: c.batch_window }
    }
}

impl WatchConfig {
    /// Zero periods would panic the batch ticker or spin the retry loop.
    pub fn clamped(self) -> Self {
        let floor = Duration::from_millis(1);
        Self {
            backoff_base: self.backoff_base.max(floor),
            backoff_max: self.backoff_max.max(self.backoff_base.max(floor)),
            batch_window: self.batch_window.max(floor),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

struct Connection {
    generation: u64,
    subscribers: Vec<(u64, Arc<dyn WatchSubscriber>)>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    running: bool,
}

struct Inner {
    config: WatchConfig,
    connections: Mutex<FxHashMap<ConnectionKey, Connection>>,
    next_id: AtomicU64,
}

impl Inner {
    fn subscribers(&self, key: &ConnectionKey, generation: u64) -> Vec<Arc<dyn WatchSubscriber>> {
        let conns = lock(&self.connections);
        match conns.get(key) {
            Some(conn) if conn.generation == generation => conn.subscribers.iter().map(|(_, s)| s.clone()).collect(),
            _ => Vec::new(),
        }
    }

    fn release(&self, key: &ConnectionKey, id: u64) {
        let mut conns = lock(&self.connections);
        let Some(conn) = conns.get_mut(key) else { return };
        conn.subscribers.retain(|(sid, _)| *sid != id);
        if conn.subscribers.is_empty() {
            if let Some(conn) = conns.remove(key) {
                conn.cancel.cancel();
                conn.state.send_replace(ConnectionState::Closed);
                debug!(client = %key.client, ns = ?key.namespace, "watch: last subscriber left; closing");
            }
        }
        metrics::gauge!("watch_connections", conns.len() as f64);
    }

    /// Mark the connection closed so a later subscribe restarts it.
    fn finished(&self, key: &ConnectionKey, generation: u64) {
        let mut conns = lock(&self.connections);
        if let Some(conn) = conns.get_mut(key) {
            if conn.generation == generation {
                conn.running = false;
                conn.state.send_replace(ConnectionState::Closed);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let conns = self.connections.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for conn in conns.values() {
            conn.cancel.cancel();
        }
    }
}

/// Multiplexes subscriptions onto ref-counted watch connections.
#[derive(Clone)]
pub struct WatchCoordinator {
    inner: Arc<Inner>,
}

impl Default for WatchCoordinator {
    fn default() -> Self {
        Self::new(WatchConfig::default())
    }
}

impl WatchCoordinator {
    pub fn new(config: WatchConfig) -> Self {
        let config = config.clamped();
        Self {
            inner: Arc::new(Inner { config, connections: Mutex::new(FxHashMap::default()), next_id: AtomicU64::new(1) }),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    /// Join (or open) the connection for the subscriber's client and `namespace`.
    /// Cluster-scoped clients ignore the namespace.
    pub fn subscribe(&self, subscriber: Arc<dyn WatchSubscriber>, namespace: Option<&str>) -> Subscription {
        let client = subscriber.client();
        let namespace = if client.is_namespaced() { namespace.map(str::to_string) } else { None };
        let key = ConnectionKey { client: client.id(), namespace };
        let id = self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed);

        let mut conns = lock(&self.inner.connections);
        let conn = conns.entry(key.clone()).or_insert_with(|| Connection {
            generation: self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed),
            subscribers: Vec::new(),
            cancel: CancellationToken::new(),
            state: Arc::new(watch::channel(ConnectionState::Idle).0),
            running: false,
        });
        conn.subscribers.push((id, subscriber));
        if !conn.running {
            conn.running = true;
            conn.cancel = CancellationToken::new();
            conn.state.send_replace(ConnectionState::Connecting);
            let task = ConnectionTask {
                inner: Arc::downgrade(&self.inner),
                key: key.clone(),
                generation: conn.generation,
                client,
                cancel: conn.cancel.clone(),
                state: conn.state.clone(),
                config: self.inner.config.clone(),
            };
            debug!(client = %key.client, ns = ?key.namespace, "watch: opening connection");
            tokio::spawn(task.run());
        }
        metrics::gauge!("watch_connections", conns.len() as f64);
        Subscription { inner: Arc::downgrade(&self.inner), key, id, active: AtomicBool::new(true) }
    }

    pub fn state(&self, key: &ConnectionKey) -> Option<ConnectionState> {
        lock(&self.inner.connections).get(key).map(|c| *c.state.borrow())
    }

    /// Follow state transitions of one connection.
    pub fn state_changes(&self, key: &ConnectionKey) -> Option<watch::Receiver<ConnectionState>> {
        lock(&self.inner.connections).get(key).map(|c| c.state.subscribe())
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn subscriber_count(&self, key: &ConnectionKey) -> usize {
        lock(&self.inner.connections).get(key).map(|c| c.subscribers.len()).unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<ConnectionKey> {
        lock(&self.inner.connections).keys().cloned().collect()
    }
}

/// One logical interest in a connection. Unsubscribes on drop.
pub struct Subscription {
    inner: Weak<Inner>,
    key: ConnectionKey,
    id: u64,
    active: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).field("active", &self.is_active()).finish()
    }
}

impl Subscription {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::Acquire)
    }

    /// Idempotent; safe from inside a store listener.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, AtomicOrdering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.release(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

enum Step {
    Stop,
    Reconnect,
    Resync,
    Failed(Error),
}

struct ConnectionTask {
    inner: Weak<Inner>,
    key: ConnectionKey,
    generation: u64,
    client: Arc<ResourceApiClient>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    config: WatchConfig,
}

impl ConnectionTask {
    fn set(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(client = %self.key.client, ns = ?self.key.namespace, from = ?prev, to = ?next, "watch: state");
        }
    }

    fn subscribers(&self) -> Vec<Arc<dyn WatchSubscriber>> {
        match self.inner.upgrade() {
            Some(inner) => inner.subscribers(&self.key, self.generation),
            None => Vec::new(),
        }
    }

    fn ns(&self) -> Option<&str> {
        self.key.namespace.as_deref()
    }

    /// Oldest resume point among subscribers; `None` if any of them has none.
    fn resume_point(&self, subs: &[Arc<dyn WatchSubscriber>]) -> Option<String> {
        let mut oldest: Option<String> = None;
        for sub in subs {
            let rv = sub.resume_version(self.ns())?;
            oldest = match oldest {
                Some(cur) if !is_older_version(&rv, &cur) => Some(cur),
                _ => Some(rv),
            };
        }
        oldest
    }

    async fn run(self) {
        let mut backoff = ExponentialBackoff::new(self.config.backoff_base, self.config.backoff_max);
        // Set by a resync, cleared once a stream opens. A second resync in a row backs off.
        let mut resynced = false;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let subs = self.subscribers();
            if subs.is_empty() {
                break;
            }
            self.set(ConnectionState::Connecting);
            let since = self.resume_point(&subs);
            drop(subs);
            let step = match since {
                None => Step::Resync,
                Some(since) => {
                    let opened = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        r = self.client.watch(self.ns(), Some(&since)) => r,
                    };
                    match opened {
                        Ok(stream) => {
                            resynced = false;
                            self.set(ConnectionState::Streaming);
                            self.pump(stream, &mut backoff).await
                        }
                        Err(Error::Stale(_)) => Step::Resync,
                        Err(e) => Step::Failed(e),
                    }
                }
            };

            let failure = match step {
                Step::Stop => break,
                Step::Reconnect => continue,
                Step::Resync if resynced => {
                    resynced = false;
                    Error::Stale("no usable resume version after resync".into())
                }
                Step::Resync => match self.resync_all().await {
                    Ok(()) => {
                        resynced = true;
                        continue;
                    }
                    Err(e) => e,
                },
                Step::Failed(e) => e,
            };
            if self.cancel.is_cancelled() {
                break;
            }
            self.set(ConnectionState::Error);
            if failure.is_auth() {
                error!(client = %self.key.client, ns = ?self.key.namespace, error = %failure, "watch: not authorized; giving up");
                for sub in self.subscribers() {
                    sub.watch_failed(self.ns(), &failure);
                }
                break;
            }
            let delay = backoff.next_delay();
            warn!(client = %self.key.client, ns = ?self.key.namespace, error = %failure, delay_ms = delay.as_millis() as u64, "watch: connection failed; backing off");
            metrics::counter!("watch_reconnects_total", 1u64);
            self.set(ConnectionState::Backoff);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match self.inner.upgrade() {
            Some(inner) => inner.finished(&self.key, self.generation),
            None => self.set(ConnectionState::Closed),
        }
        debug!(client = %self.key.client, ns = ?self.key.namespace, "watch: connection task exited");
    }

    async fn resync_all(&self) -> Result<()> {
        info!(client = %self.key.client, ns = ?self.key.namespace, "watch: resync required");
        let subs = self.subscribers();
        let all = futures::future::join_all(subs.into_iter().map(|s| s.resync()));
        let results = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = all => r,
        };
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }

    /// Drain the stream, delivering one batch per window.
    async fn pump(&self, mut stream: WatchStream, backoff: &mut ExponentialBackoff) -> Step {
        let mut batch = Batch::default();
        let mut received = false;
        let mut ticker = tokio::time::interval(self.config.batch_window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let step = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Step::Stop,
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        if !received {
                            received = true;
                            backoff.reset();
                        }
                        batch.push(frame);
                    }
                    Some(Err(Error::Stale(msg))) => {
                        debug!(client = %self.key.client, reason = %msg, "watch: resource version gone");
                        break Step::Resync;
                    }
                    Some(Err(e)) => break Step::Failed(e),
                    None if received => break Step::Reconnect,
                    None => break Step::Failed(Error::Transport("watch stream closed before any event".into())),
                },
                _ = ticker.tick() => self.flush(&mut batch),
            }
        };
        if !matches!(step, Step::Stop) {
            self.flush(&mut batch);
        }
        step
    }

    fn flush(&self, batch: &mut Batch) {
        if batch.is_empty() {
            return;
        }
        for sub in self.subscribers() {
            sub.deliver(self.ns(), &batch.events, batch.bookmark.as_deref());
        }
        batch.events.clear();
        batch.bookmark = None;
    }
}

#[derive(Default)]
struct Batch {
    events: Vec<WatchEvent>,
    bookmark: Option<String>,
}

impl Batch {
    fn push(&mut self, frame: WatchFrame) {
        match frame {
            WatchFrame::Event(ev) => self.events.push(ev),
            WatchFrame::Bookmark(rv) => self.bookmark = Some(rv),
        }
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty() && self.bookmark.is_none()
    }
}
