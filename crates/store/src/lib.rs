//! Skerry store: observable in-RAM collections kept current by list + watch.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use rustc_hash::FxHashMap;
use serde_json::Value;
use skerry_core::{is_older_version, Error, EventKind, Result, TypedObject, WatchEvent};
use skerry_kubehub::{CallOptions, ResourceApiClient};
use smallvec::SmallVec;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod backoff;
mod coordinator;

pub use backoff::ExponentialBackoff;
pub use coordinator::{ConnectionKey, ConnectionState, Subscription, WatchConfig, WatchCoordinator, WatchSubscriber};

/// Sort order for store items. Ties are always broken by uid.
pub type Comparator = Arc<dyn Fn(&TypedObject, &TypedObject) -> Ordering + Send + Sync>;

/// Observer callback, invoked once per applied batch, outside the store lock.
pub type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

type SharedLoad = Shared<BoxFuture<'static, Result<()>>>;

/// Namespace, then name.
pub fn default_order(a: &TypedObject, b: &TypedObject) -> Ordering {
    a.namespace().cmp(&b.namespace()).then_with(|| a.name().cmp(b.name()))
}

fn full_order(cmp: &Comparator, a: &TypedObject, b: &TypedObject) -> Ordering {
    cmp(a, b).then_with(|| a.uid().cmp(b.uid()))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Immutable view of the sorted items at one epoch.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub items: Vec<Arc<TypedObject>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeReason {
    Loaded,
    LoadFailed(Error),
    Events(ApplyOutcome),
    Resorted,
    WatchFailed(Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub epoch: u64,
    pub reason: ChangeReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub discarded: usize,
}

/// Which namespaces a load covers. `None` means cluster-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LoadKey(Option<BTreeSet<String>>);

impl LoadKey {
    pub fn all() -> Self {
        Self(None)
    }

    pub fn namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Some(namespaces.into_iter().map(Into::into).collect()))
    }

    /// One list/watch scope per namespace, or a single cluster-wide scope.
    pub fn scopes(&self) -> Vec<Option<String>> {
        match &self.0 {
            None => vec![None],
            Some(set) => set.iter().cloned().map(Some).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub key: LoadKey,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl LoadOptions {
    pub fn namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { key: LoadKey::namespaces(namespaces), ..Self::default() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadStatus {
    pub is_loaded: bool,
    pub is_loading: bool,
    pub failed_loading: bool,
    pub last_error: Option<Error>,
}

/// Where a batch came from. Local writes never move resume versions.
#[derive(Clone, Copy)]
enum Source<'a> {
    Watch(Option<&'a str>),
    Local,
}

struct State {
    cmp: Comparator,
    items: Vec<Arc<TypedObject>>,
    by_uid: FxHashMap<String, Arc<TypedObject>>,
    by_name: FxHashMap<String, SmallVec<[String; 1]>>,
    status: LoadStatus,
    last_resource_version: Option<String>,
    scope_versions: FxHashMap<Option<String>, String>,
    last_key: Option<LoadKey>,
    inflight: Option<(LoadKey, SharedLoad)>,
    epoch: u64,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl State {
    fn new(cmp: Comparator) -> Self {
        Self {
            cmp,
            items: Vec::new(),
            by_uid: FxHashMap::default(),
            by_name: FxHashMap::default(),
            status: LoadStatus::default(),
            last_resource_version: None,
            scope_versions: FxHashMap::default(),
            last_key: None,
            inflight: None,
            epoch: 0,
            listeners: Vec::new(),
            next_listener: 1,
        }
    }

    fn position_of(&self, obj: &TypedObject) -> Option<usize> {
        let cmp = &self.cmp;
        match self.items.binary_search_by(|p| full_order(cmp, p, obj)) {
            Ok(idx) => Some(idx),
            Err(_) => self.items.iter().position(|p| p.uid() == obj.uid()),
        }
    }

    fn upsert(&mut self, obj: Arc<TypedObject>) {
        let cmp = self.cmp.clone();
        if let Some(old) = self.by_uid.get(obj.uid()).cloned() {
            if let Some(idx) = self.position_of(&old) {
                let fits_before = idx == 0 || full_order(&cmp, &self.items[idx - 1], &obj) == Ordering::Less;
                let fits_after = idx + 1 == self.items.len() || full_order(&cmp, &obj, &self.items[idx + 1]) == Ordering::Less;
                if fits_before && fits_after {
                    self.items[idx] = obj.clone();
                    self.reindex(&old, obj);
                    return;
                }
                self.items.remove(idx);
            }
            self.unindex_name(&old);
        }
        let pos = self.items.partition_point(|p| full_order(&cmp, p, &obj) == Ordering::Less);
        self.items.insert(pos, obj.clone());
        self.by_name.entry(obj.name().to_string()).or_default().push(obj.uid().to_string());
        self.by_uid.insert(obj.uid().to_string(), obj);
    }

    fn reindex(&mut self, old: &TypedObject, obj: Arc<TypedObject>) {
        if old.name() != obj.name() {
            self.unindex_name(old);
            self.by_name.entry(obj.name().to_string()).or_default().push(obj.uid().to_string());
        }
        self.by_uid.insert(obj.uid().to_string(), obj);
    }

    fn remove(&mut self, uid: &str) -> Option<Arc<TypedObject>> {
        let old = self.by_uid.get(uid).cloned()?;
        if let Some(idx) = self.position_of(&old) {
            self.items.remove(idx);
        }
        self.by_uid.remove(uid);
        self.unindex_name(&old);
        Some(old)
    }

    fn unindex_name(&mut self, obj: &TypedObject) {
        if let Some(uids) = self.by_name.get_mut(obj.name()) {
            uids.retain(|u| u != obj.uid());
            if uids.is_empty() {
                self.by_name.remove(obj.name());
            }
        }
    }

    fn replace_all(&mut self, objects: Vec<TypedObject>) {
        let mut by_uid: FxHashMap<String, Arc<TypedObject>> = FxHashMap::default();
        for obj in objects {
            let keep_current = by_uid
                .get(obj.uid())
                .map(|cur| is_older_version(obj.resource_version(), cur.resource_version()))
                .unwrap_or(false);
            if !keep_current {
                by_uid.insert(obj.uid().to_string(), Arc::new(obj));
            }
        }
        let mut items: Vec<Arc<TypedObject>> = by_uid.values().cloned().collect();
        let cmp = self.cmp.clone();
        items.sort_by(|a, b| full_order(&cmp, a, b));
        let mut by_name: FxHashMap<String, SmallVec<[String; 1]>> = FxHashMap::default();
        for obj in &items {
            by_name.entry(obj.name().to_string()).or_default().push(obj.uid().to_string());
        }
        self.items = items;
        self.by_uid = by_uid;
        self.by_name = by_name;
    }

    fn resort(&mut self) {
        let cmp = self.cmp.clone();
        self.items.sort_by(|a, b| full_order(&cmp, a, b));
    }

    /// Versions only move forward; incomparable tokens replace the previous one.
    fn advance_version(&mut self, scope: Option<&str>, rv: &str) {
        if rv.is_empty() {
            return;
        }
        let newer = |cur: Option<&String>| cur.map(|c| !is_older_version(rv, c)).unwrap_or(true);
        if newer(self.last_resource_version.as_ref()) {
            self.last_resource_version = Some(rv.to_string());
        }
        let key = scope.map(str::to_string);
        if newer(self.scope_versions.get(&key)) {
            self.scope_versions.insert(key, rv.to_string());
        }
    }
}

/// Live collection of one resource kind, bound to a single client for its whole life.
pub struct ObjectStore {
    client: Arc<ResourceApiClient>,
    state: Mutex<State>,
    snapshot: ArcSwap<StoreSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("kind", &self.client.kind())
            .field("client", &self.client.id())
            .field("len", &self.len())
            .finish()
    }
}

impl ObjectStore {
    pub fn new(client: Arc<ResourceApiClient>) -> Arc<Self> {
        Self::with_comparator(client, Arc::new(default_order))
    }

    pub fn with_comparator(client: Arc<ResourceApiClient>, cmp: Comparator) -> Arc<Self> {
        let (epoch_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            client,
            state: Mutex::new(State::new(cmp)),
            snapshot: ArcSwap::from_pointee(StoreSnapshot::default()),
            epoch_tx,
        })
    }

    pub fn client(&self) -> &Arc<ResourceApiClient> {
        &self.client
    }

    pub fn kind(&self) -> &str {
        self.client.kind()
    }

    // ----- reads -----

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.load_full()
    }

    pub fn items(&self) -> Vec<Arc<TypedObject>> {
        self.snapshot.load().items.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_by_id(&self, uid: &str) -> Option<Arc<TypedObject>> {
        lock(&self.state).by_uid.get(uid).cloned()
    }

    /// First object with `name`, restricted to `namespace` when given.
    pub fn get_by_name(&self, name: &str, namespace: Option<&str>) -> Option<Arc<TypedObject>> {
        let st = lock(&self.state);
        let uids = st.by_name.get(name)?;
        uids.iter()
            .filter_map(|uid| st.by_uid.get(uid))
            .find(|obj| namespace.is_none() || obj.namespace() == namespace)
            .cloned()
    }

    pub fn status(&self) -> LoadStatus {
        lock(&self.state).status.clone()
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.state).status.is_loaded
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).status.is_loading
    }

    pub fn failed_loading(&self) -> bool {
        lock(&self.state).status.failed_loading
    }

    pub fn last_error(&self) -> Option<Error> {
        lock(&self.state).status.last_error.clone()
    }

    pub fn last_resource_version(&self) -> Option<String> {
        lock(&self.state).last_resource_version.clone()
    }

    /// Resume point for one watch scope, falling back to the overall version.
    pub fn resume_version(&self, namespace: Option<&str>) -> Option<String> {
        let st = lock(&self.state);
        st.scope_versions
            .get(&namespace.map(str::to_string))
            .or(st.last_resource_version.as_ref())
            .cloned()
    }

    /// Scopes of the most recent load, cluster-wide if never loaded.
    pub fn load_key(&self) -> LoadKey {
        lock(&self.state).last_key.clone().unwrap_or_default()
    }

    // ----- observers -----

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let mut st = lock(&self.state);
        let id = ListenerId(st.next_listener);
        st.next_listener += 1;
        st.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut st = lock(&self.state);
        let before = st.listeners.len();
        st.listeners.retain(|(lid, _)| *lid != id);
        st.listeners.len() != before
    }

    /// Coalescing epoch channel; bumps once per published change.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn set_comparator(&self, cmp: Comparator) {
        let notify = {
            let mut st = lock(&self.state);
            st.cmp = cmp;
            st.resort();
            self.publish(&mut st, ChangeReason::Resorted)
        };
        notify.fire();
    }

    /// Swap the snapshot and bump the epoch; listeners run after the lock drops.
    fn publish(&self, st: &mut State, reason: ChangeReason) -> Notify {
        st.epoch = st.epoch.saturating_add(1);
        self.snapshot.store(Arc::new(StoreSnapshot { epoch: st.epoch, items: st.items.clone() }));
        self.epoch_tx.send_replace(st.epoch);
        metrics::gauge!("store_items", st.items.len() as f64, "kind" => self.client.kind().to_string());
        Notify {
            change: StoreChange { epoch: st.epoch, reason },
            listeners: st.listeners.iter().map(|(_, l)| l.clone()).collect(),
        }
    }

    // ----- events -----

    pub fn apply_event(&self, event: WatchEvent) -> ApplyOutcome {
        self.apply_batch(Source::Watch(None), std::slice::from_ref(&event), None)
    }

    /// Apply a burst of events with a single notification.
    pub fn apply_events(&self, events: &[WatchEvent]) -> ApplyOutcome {
        self.apply_batch(Source::Watch(None), events, None)
    }

    /// Batch from the watch connection for `namespace`.
    pub fn deliver(&self, namespace: Option<&str>, events: &[WatchEvent], bookmark: Option<&str>) -> ApplyOutcome {
        self.apply_batch(Source::Watch(namespace), events, bookmark)
    }

    fn apply_batch(&self, source: Source<'_>, events: &[WatchEvent], bookmark: Option<&str>) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut changed = false;
        let notify = {
            let mut st = lock(&self.state);
            for ev in events {
                let obj = &ev.object;
                let stale = st
                    .by_uid
                    .get(obj.uid())
                    .map(|cur| is_older_version(obj.resource_version(), cur.resource_version()))
                    .unwrap_or(false);
                if stale {
                    debug!(kind = %self.client.kind(), uid = %obj.uid(), rv = %obj.resource_version(), "store: discarded stale event");
                    outcome.discarded += 1;
                    continue;
                }
                match ev.kind {
                    EventKind::Added | EventKind::Modified => {
                        st.upsert(Arc::new(obj.clone()));
                        changed = true;
                    }
                    EventKind::Deleted => changed |= st.remove(obj.uid()).is_some(),
                }
                outcome.applied += 1;
                if let Source::Watch(scope) = source {
                    st.advance_version(scope, obj.resource_version());
                }
            }
            if let (Source::Watch(scope), Some(rv)) = (source, bookmark) {
                st.advance_version(scope, rv);
            }
            changed.then(|| self.publish(&mut st, ChangeReason::Events(outcome)))
        };
        metrics::counter!("store_events_applied_total", outcome.applied as u64, "kind" => self.client.kind().to_string());
        if outcome.discarded > 0 {
            metrics::counter!("store_events_discarded_total", outcome.discarded as u64, "kind" => self.client.kind().to_string());
        }
        if let Some(n) = notify {
            n.fire();
        }
        outcome
    }

    /// Record a watch failure that will not be retried.
    pub fn watch_failed(&self, namespace: Option<&str>, error: &Error) {
        warn!(kind = %self.client.kind(), ns = ?namespace, error = %error, "store: watch stopped");
        let notify = {
            let mut st = lock(&self.state);
            st.status.last_error = Some(error.clone());
            self.publish(&mut st, ChangeReason::WatchFailed(error.clone()))
        };
        notify.fire();
    }

    // ----- loading -----

    /// List the given scopes and replace items wholesale. Concurrent calls with the
    /// same key share one request; a call with another key waits for the current one.
    pub async fn load_all(self: &Arc<Self>, opts: LoadOptions) -> Result<()> {
        enum Next {
            Join(SharedLoad),
            Wait(SharedLoad),
        }
        loop {
            let next = {
                let mut st = lock(&self.state);
                match &st.inflight {
                    Some((key, fut)) if *key == opts.key => Next::Join(fut.clone()),
                    Some((_, fut)) => Next::Wait(fut.clone()),
                    None => {
                        let task = tokio::spawn(self.clone().run_load(opts.clone()));
                        let fut = async move {
                            match task.await {
                                Ok(res) => res,
                                Err(e) => Err(Error::Transport(format!("load task failed: {e}"))),
                            }
                        }
                        .boxed()
                        .shared();
                        st.inflight = Some((opts.key.clone(), fut.clone()));
                        st.status.is_loading = true;
                        Next::Join(fut)
                    }
                }
            };
            match next {
                Next::Join(fut) => return with_cancel(opts.cancel.as_ref(), fut).await,
                Next::Wait(fut) => {
                    let _ = with_cancel(opts.cancel.as_ref(), fut).await;
                    if opts.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    /// Reload the scopes of the last load.
    pub async fn resync(self: &Arc<Self>) -> Result<()> {
        metrics::counter!("watch_resyncs_total", 1u64, "kind" => self.client.kind().to_string());
        info!(kind = %self.client.kind(), "store: resync");
        self.load_all(LoadOptions { key: self.load_key(), ..LoadOptions::default() }).await
    }

    async fn run_load(self: Arc<Self>, opts: LoadOptions) -> Result<()> {
        let t0 = Instant::now();
        let kind = self.client.kind().to_string();
        let scopes = self.scopes_of(&opts.key);
        info!(kind = %kind, scopes = ?scopes, "store: load start");
        let call = CallOptions { timeout: opts.timeout, cancel: opts.cancel.clone() };
        let lists = futures::future::try_join_all(scopes.iter().map(|ns| self.client.list(ns.as_deref(), &call)));
        let res = with_cancel(opts.cancel.as_ref(), lists).await;

        let notify = {
            let mut st = lock(&self.state);
            st.inflight = None;
            st.status.is_loading = false;
            match &res {
                Ok(results) => {
                    let mut objects = Vec::new();
                    let mut newest: Option<String> = None;
                    st.scope_versions.clear();
                    for (scope, list) in scopes.iter().zip(results) {
                        objects.extend(list.items.iter().cloned());
                        if let Some(rv) = &list.resource_version {
                            st.scope_versions.insert(scope.clone(), rv.clone());
                            if newest.as_ref().map(|n| !is_older_version(rv, n)).unwrap_or(true) {
                                newest = Some(rv.clone());
                            }
                        }
                    }
                    st.replace_all(objects);
                    st.last_resource_version = newest;
                    st.last_key = Some(opts.key.clone());
                    st.status.is_loaded = true;
                    st.status.failed_loading = false;
                    st.status.last_error = None;
                    let took_ms = t0.elapsed().as_millis();
                    metrics::histogram!("store_load_ms", took_ms as f64, "kind" => kind.clone());
                    info!(kind = %kind, items = st.items.len(), took_ms = %took_ms, "store: load ok");
                    Some(self.publish(&mut st, ChangeReason::Loaded))
                }
                Err(Error::Cancelled) => {
                    debug!(kind = %kind, "store: load cancelled");
                    None
                }
                Err(e) => {
                    st.status.failed_loading = true;
                    st.status.last_error = Some(e.clone());
                    warn!(kind = %kind, error = %e, "store: load failed; keeping previous items");
                    Some(self.publish(&mut st, ChangeReason::LoadFailed(e.clone())))
                }
            }
        };
        if let Some(n) = notify {
            n.fire();
        }
        res.map(|_| ())
    }

    /// Cluster-scoped kinds have one scope whatever namespaces were asked for.
    fn scopes_of(&self, key: &LoadKey) -> Vec<Option<String>> {
        if self.client.is_namespaced() {
            key.scopes()
        } else {
            vec![None]
        }
    }

    /// Load, then keep every loaded scope current through `coordinator`.
    pub async fn load_and_watch(self: &Arc<Self>, opts: LoadOptions, coordinator: &WatchCoordinator) -> Result<WatchHandle> {
        self.load_all(opts).await?;
        Ok(self.watch(coordinator))
    }

    /// Subscribe every scope of the last load. Dropping the handle unsubscribes.
    pub fn watch(self: &Arc<Self>, coordinator: &WatchCoordinator) -> WatchHandle {
        let subscriber: Arc<dyn WatchSubscriber> = self.clone();
        let subscriptions = self
            .scopes_of(&self.load_key())
            .iter()
            .map(|ns| coordinator.subscribe(subscriber.clone(), ns.as_deref()))
            .collect();
        WatchHandle { subscriptions }
    }

    // ----- writes -----

    pub async fn create(&self, namespace: Option<&str>, body: Value) -> Result<Arc<TypedObject>> {
        let obj = self.client.create(namespace, body).await?;
        let uid = obj.uid().to_string();
        self.apply_batch(Source::Local, &[WatchEvent::added(obj.clone())], None);
        Ok(self.get_by_id(&uid).unwrap_or_else(|| Arc::new(obj)))
    }

    pub async fn patch(&self, name: &str, namespace: Option<&str>, patch: Value) -> Result<Option<Arc<TypedObject>>> {
        let Some(obj) = self.client.patch(name, namespace, patch).await? else {
            self.forget(name, namespace);
            return Ok(None);
        };
        let uid = obj.uid().to_string();
        self.apply_batch(Source::Local, &[WatchEvent::modified(obj.clone())], None);
        Ok(Some(self.get_by_id(&uid).unwrap_or_else(|| Arc::new(obj))))
    }

    /// Delete remotely, then drop the local copy. Returns whether the server had it.
    pub async fn remove(&self, name: &str, namespace: Option<&str>) -> Result<bool> {
        let existed = self.client.delete(name, namespace).await?;
        self.forget(name, namespace);
        Ok(existed)
    }

    fn forget(&self, name: &str, namespace: Option<&str>) {
        if let Some(obj) = self.get_by_name(name, namespace) {
            self.apply_batch(Source::Local, &[WatchEvent::deleted((*obj).clone())], None);
        }
    }
}

#[async_trait::async_trait]
impl WatchSubscriber for ObjectStore {
    fn client(&self) -> Arc<ResourceApiClient> {
        self.client.clone()
    }

    fn resume_version(&self, namespace: Option<&str>) -> Option<String> {
        if !self.is_loaded() {
            return None;
        }
        ObjectStore::resume_version(self, namespace)
    }

    fn deliver(&self, namespace: Option<&str>, events: &[WatchEvent], bookmark: Option<&str>) {
        ObjectStore::deliver(self, namespace, events, bookmark);
    }

    async fn resync(self: Arc<Self>) -> Result<()> {
        ObjectStore::resync(&self).await
    }

    fn watch_failed(&self, namespace: Option<&str>, error: &Error) {
        ObjectStore::watch_failed(self, namespace, error);
    }
}

/// Subscriptions held on behalf of one store.
pub struct WatchHandle {
    subscriptions: Vec<Subscription>,
}

impl WatchHandle {
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        for sub in &self.subscriptions {
            sub.unsubscribe();
        }
    }
}

struct Notify {
    change: StoreChange,
    listeners: Vec<Listener>,
}

impl Notify {
    fn fire(self) {
        for l in &self.listeners {
            l(&self.change);
        }
    }
}

async fn with_cancel<F, T>(cancel: Option<&CancellationToken>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        },
        None => fut.await,
    }
}
