//! Typed REST+watch client bound to one resource kind.
//!
//! A client talks to its *current* address. When the collection root answers 404
//! the client probes its fallback addresses in order and permanently switches to
//! the first one that serves, then tells its registry index about the move.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use skerry_core::{ApiStatus, Error, ResourceAddress, ResourceIdentity, Result, TypedObject, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{ApiRequest, ApiResponse, FrameStream, Transport};
use crate::util::{read, write};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique client handle, used as a map key instead of the mutable address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Index that must follow a client when its current address is rewritten.
pub trait AddressIndex: Send + Sync {
    fn repoint(&self, client: &ResourceApiClient, from: &ResourceAddress, to: &ResourceAddress);
}

/// Per-call overrides for one-shot RPCs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub items: Vec<TypedObject>,
    /// Collection resourceVersion, the point a watch resumes from.
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchFrame {
    Event(WatchEvent),
    Bookmark(String),
}

/// Decoded watch stream. An in-stream `410` surfaces as `Err(Error::Stale)`.
pub type WatchStream = BoxStream<'static, Result<WatchFrame>>;

pub struct ClientBuilder {
    identity: ResourceIdentity,
    namespaced: bool,
    address: Option<ResourceAddress>,
    fallbacks: Vec<ResourceAddress>,
    request_timeout: Duration,
}

impl ClientBuilder {
    pub fn namespaced(mut self, namespaced: bool) -> Self {
        self.namespaced = namespaced;
        self
    }

    /// Override the canonical address derived from the identity.
    pub fn address(mut self, address: ResourceAddress) -> Self {
        self.address = Some(address);
        self
    }

    pub fn fallback(mut self, address: ResourceAddress) -> Self {
        if !self.fallbacks.contains(&address) {
            self.fallbacks.push(address);
        }
        self
    }

    pub fn fallbacks(self, addresses: impl IntoIterator<Item = ResourceAddress>) -> Self {
        addresses.into_iter().fold(self, |b, a| b.fallback(a))
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> ResourceApiClient {
        let address = self.address.unwrap_or_else(|| ResourceAddress::for_identity(&self.identity));
        let fallbacks = self.fallbacks.into_iter().filter(|a| *a != address).collect();
        ResourceApiClient {
            id: ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)),
            identity: self.identity,
            namespaced: self.namespaced,
            current: ArcSwap::from_pointee(address),
            fallbacks,
            transport,
            index: RwLock::new(None),
            request_timeout: self.request_timeout,
        }
    }
}

pub struct ResourceApiClient {
    id: ClientId,
    identity: ResourceIdentity,
    namespaced: bool,
    current: ArcSwap<ResourceAddress>,
    fallbacks: Vec<ResourceAddress>,
    transport: Arc<dyn Transport>,
    index: RwLock<Option<Weak<dyn AddressIndex>>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for ResourceApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceApiClient")
            .field("id", &self.id)
            .field("kind", &self.identity.kind)
            .field("current", &self.current_address().to_string())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl ResourceApiClient {
    pub fn builder(identity: ResourceIdentity) -> ClientBuilder {
        ClientBuilder {
            identity,
            namespaced: true,
            address: None,
            fallbacks: Vec::new(),
            request_timeout: skerry_core::Config::default().request_timeout,
        }
    }

    pub fn id(&self) -> ClientId { self.id }
    pub fn identity(&self) -> &ResourceIdentity { &self.identity }
    pub fn kind(&self) -> &str { &self.identity.kind }
    pub fn is_namespaced(&self) -> bool { self.namespaced }
    pub fn fallback_addresses(&self) -> &[ResourceAddress] { &self.fallbacks }

    pub fn current_address(&self) -> ResourceAddress {
        self.current.load().as_ref().clone()
    }

    /// Group/version of the address currently in use, which differs from the
    /// declared identity after a fallback rewrite.
    pub fn api_version_with_group(&self) -> String {
        self.current.load().api_version_with_group()
    }

    /// Navigable URL of one object under the current address.
    pub fn url_for(&self, name: &str, namespace: Option<&str>) -> String {
        self.current.load().object_path(self.scope(namespace), name)
    }

    pub fn attach_index(&self, index: Weak<dyn AddressIndex>) {
        *write(&self.index) = Some(index);
    }

    pub fn detach_index(&self) {
        *write(&self.index) = None;
    }

    fn scope<'a>(&self, namespace: Option<&'a str>) -> Option<&'a str> {
        if self.namespaced { namespace } else { None }
    }

    async fn dispatch(&self, req: ApiRequest, opts: &CallOptions) -> Result<ApiResponse> {
        let timeout = opts.timeout.unwrap_or(self.request_timeout);
        metrics::counter!("client_requests_total", 1u64, "verb" => req.method());
        debug!(kind = %self.identity.kind, method = req.method(), url = %req.url(), "client: request");
        let fut = tokio::time::timeout(timeout, self.transport.request(req));
        let res = match &opts.cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = fut => r,
            },
            None => fut.await,
        };
        res.map_err(|_| Error::Timeout(timeout))?
    }

    /// Run a request against the current address, falling back when the
    /// collection root itself is gone.
    async fn call<F>(&self, opts: &CallOptions, build: F) -> Result<ApiResponse>
    where
        F: Fn(&ResourceAddress) -> ApiRequest,
    {
        let addr = self.current_address();
        let req = build(&addr);
        let targets_instance = req.name.is_some();
        let resp = self.dispatch(req, opts).await?;
        if resp.status != 404 || self.fallbacks.is_empty() {
            return Ok(resp);
        }
        if targets_instance {
            let status = ApiStatus::from_body(resp.status, &resp.body);
            if status.names_instance() || self.root_alive(&addr, opts).await? {
                return Ok(resp);
            }
        }
        match self.probe_fallbacks(&addr, opts).await? {
            Some(next) => self.dispatch(build(&next), opts).await,
            None => Ok(resp),
        }
    }

    async fn root_alive(&self, addr: &ResourceAddress, opts: &CallOptions) -> Result<bool> {
        let probe = ApiRequest::list(addr.collection_path(None)).with_limit(1);
        Ok(self.dispatch(probe, opts).await?.status != 404)
    }

    async fn probe_fallbacks(&self, from: &ResourceAddress, opts: &CallOptions) -> Result<Option<ResourceAddress>> {
        for candidate in self.fallbacks.iter().filter(|a| *a != from) {
            let probe = ApiRequest::list(candidate.collection_path(None)).with_limit(1);
            match self.dispatch(probe, opts).await {
                Ok(resp) if resp.is_success() => {
                    self.rewrite(from, candidate);
                    return Ok(Some(candidate.clone()));
                }
                Ok(resp) => debug!(candidate = %candidate, status = resp.status, "client: fallback probe rejected"),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => debug!(candidate = %candidate, error = %e, "client: fallback probe failed"),
            }
        }
        warn!(kind = %self.identity.kind, address = %from, "client: no fallback address serves this resource");
        Ok(None)
    }

    fn rewrite(&self, from: &ResourceAddress, to: &ResourceAddress) {
        self.current.store(Arc::new(to.clone()));
        metrics::counter!("client_fallback_repoints_total", 1u64);
        info!(kind = %self.identity.kind, from = %from, to = %to, "client: address rewritten to fallback");
        let index = read(&self.index).as_ref().and_then(|w| w.upgrade());
        if let Some(index) = index {
            index.repoint(self, from, to);
        }
    }

    fn decode(&self, raw: Value) -> Result<TypedObject> {
        let mut obj = TypedObject::from_value(raw)?;
        if obj.kind.is_none() {
            obj.kind = Some(self.identity.kind.clone());
        }
        if obj.api_version.is_none() {
            obj.api_version = Some(self.api_version_with_group());
        }
        Ok(obj)
    }

    /// Fetch one object. A missing instance is `Ok(None)`.
    pub async fn get(&self, name: &str, namespace: Option<&str>, opts: &CallOptions) -> Result<Option<TypedObject>> {
        let ns = self.scope(namespace);
        let resp = self.call(opts, |a| ApiRequest::get(a.collection_path(ns), name)).await?;
        match resp.into_success() {
            Ok(r) => Ok(Some(self.decode(r.json()?)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List the collection, cluster-wide when `namespace` is `None`. An unknown
    /// collection lists as empty.
    pub async fn list(&self, namespace: Option<&str>, opts: &CallOptions) -> Result<ListResult> {
        let ns = self.scope(namespace);
        let resp = self.call(opts, |a| ApiRequest::list(a.collection_path(ns))).await?;
        let body = match resp.into_success() {
            Ok(r) => r.json()?,
            Err(Error::NotFound(_)) => return Ok(ListResult::default()),
            Err(e) => return Err(e),
        };
        let resource_version = body
            .pointer("/metadata/resourceVersion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let raw_items = match body.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let items = raw_items.into_iter().map(|raw| self.decode(raw)).collect::<Result<Vec<_>>>()?;
        Ok(ListResult { items, resource_version })
    }

    /// Create an object. The namespace defaults to the body's `metadata.namespace`.
    pub async fn create(&self, namespace: Option<&str>, body: Value) -> Result<TypedObject> {
        let body_ns = body.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let ns = self.scope(namespace.or(body_ns.as_deref()));
        let bytes = serde_json::to_vec(&body).map_err(|e| Error::Decode(e.to_string()))?;
        let resp = self
            .call(&CallOptions::default(), |a| ApiRequest::create(a.collection_path(ns), bytes.clone()))
            .await?;
        self.decode(resp.into_success()?.json()?)
    }

    /// JSON merge patch. A missing instance is `Ok(None)`.
    pub async fn patch(&self, name: &str, namespace: Option<&str>, patch: Value) -> Result<Option<TypedObject>> {
        let ns = self.scope(namespace);
        let bytes = serde_json::to_vec(&patch).map_err(|e| Error::Decode(e.to_string()))?;
        let resp = self
            .call(&CallOptions::default(), |a| ApiRequest::patch(a.collection_path(ns), name, bytes.clone()))
            .await?;
        match resp.into_success() {
            Ok(r) => Ok(Some(self.decode(r.json()?)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete an object; `Ok(false)` when it was already absent.
    pub async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<bool> {
        let ns = self.scope(namespace);
        let resp = self.call(&CallOptions::default(), |a| ApiRequest::delete(a.collection_path(ns), name)).await?;
        match resp.into_success() {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a watch, resuming after `since`. `Err(Error::Stale)` on open or in the
    /// stream means the caller must list again before watching.
    pub async fn watch(&self, namespace: Option<&str>, since: Option<&str>) -> Result<WatchStream> {
        let ns = self.scope(namespace);
        let addr = self.current_address();
        let frames = match self.open(&addr, ns, since).await {
            Err(Error::NotFound(message)) if !self.fallbacks.is_empty() => {
                match self.probe_fallbacks(&addr, &CallOptions::default()).await? {
                    Some(next) => self.open(&next, ns, since).await?,
                    None => return Err(Error::NotFound(message)),
                }
            }
            other => other?,
        };
        let kind = self.identity.kind.clone();
        Ok(frames
            .filter_map(move |raw| futures::future::ready(decode_frame(&kind, raw).transpose()))
            .boxed())
    }

    async fn open(&self, addr: &ResourceAddress, ns: Option<&str>, since: Option<&str>) -> Result<FrameStream> {
        let timeout = self.request_timeout;
        let collection = addr.collection_path(ns);
        tokio::time::timeout(timeout, self.transport.open_stream(&collection, since))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }
}

/// Decode one wire frame. Malformed objects are skipped rather than tearing the
/// stream down; `ERROR` frames become errors.
fn decode_frame(kind: &str, raw: Result<Value>) -> Result<Option<WatchFrame>> {
    let raw = raw?;
    let ty = raw.get("type").and_then(|t| t.as_str()).unwrap_or("").to_string();
    let object = raw.get("object").cloned().unwrap_or(Value::Null);
    let event = |build: fn(TypedObject) -> WatchEvent| match TypedObject::from_value(object.clone()) {
        Ok(obj) => Some(WatchFrame::Event(build(obj))),
        Err(e) => {
            warn!(kind = %kind, error = %e, "watch: skipping undecodable object");
            None
        }
    };
    match ty.as_str() {
        "ADDED" => Ok(event(WatchEvent::added)),
        "MODIFIED" => Ok(event(WatchEvent::modified)),
        "DELETED" => Ok(event(WatchEvent::deleted)),
        "BOOKMARK" => Ok(object
            .pointer("/metadata/resourceVersion")
            .and_then(|v| v.as_str())
            .map(|rv| WatchFrame::Bookmark(rv.to_string()))),
        "ERROR" => {
            let code = object.get("code").and_then(|c| c.as_u64()).and_then(|c| u16::try_from(c).ok()).unwrap_or(500);
            let body = serde_json::to_vec(&object).unwrap_or_default();
            Err(ApiStatus::from_body(code, &body).into_error())
        }
        other => {
            warn!(kind = %kind, frame = %other, "watch: skipping unknown frame type");
            Ok(None)
        }
    }
}
