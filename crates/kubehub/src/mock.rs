//! In-memory transport for tests: scripted responses per `(method, path)`, a call
//! log, optional latency, and watch streams fed through channels.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{json, Value};
use skerry_core::{Error, Result};

use crate::transport::{ApiRequest, ApiResponse, FrameStream, Transport};
use crate::util::lock;

type RouteKey = (String, String);

enum StreamScript {
    Feed(mpsc::UnboundedReceiver<Result<Value>>),
    Fail(Error),
}

#[derive(Default)]
struct MockState {
    sticky: HashMap<RouteKey, ApiResponse>,
    once: HashMap<RouteKey, VecDeque<ApiResponse>>,
    calls: Vec<String>,
    streams: HashMap<String, VecDeque<StreamScript>>,
    opens: Vec<(String, Option<String>)>,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    latency: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self { Self::default() }

    /// Every request sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Answer every `(method, path)` request with this JSON body.
    pub fn respond(&self, method: &str, path: &str, status: u16, body: Value) {
        let resp = ApiResponse { status, body: serde_json::to_vec(&body).unwrap_or_default() };
        lock(&self.state).sticky.insert((method.to_string(), path.to_string()), resp);
    }

    /// Answer with a raw text body, e.g. `404 page not found`.
    pub fn respond_text(&self, method: &str, path: &str, status: u16, body: &str) {
        let resp = ApiResponse { status, body: body.as_bytes().to_vec() };
        lock(&self.state).sticky.insert((method.to_string(), path.to_string()), resp);
    }

    /// Queue a one-shot answer consumed before any sticky one.
    pub fn respond_once(&self, method: &str, path: &str, status: u16, body: Value) {
        let resp = ApiResponse { status, body: serde_json::to_vec(&body).unwrap_or_default() };
        lock(&self.state).once.entry((method.to_string(), path.to_string())).or_default().push_back(resp);
    }

    /// Script the next watch opened on `collection`; frames are pushed through the feed.
    pub fn push_watch(&self, collection: &str) -> WatchFeed {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.state).streams.entry(collection.to_string()).or_default().push_back(StreamScript::Feed(rx));
        WatchFeed { tx }
    }

    /// Script the next watch opened on `collection` to fail on open.
    pub fn fail_watch(&self, collection: &str, err: Error) {
        lock(&self.state).streams.entry(collection.to_string()).or_default().push_back(StreamScript::Fail(err));
    }

    /// Log of requests as `METHOD url`.
    pub fn calls(&self) -> Vec<String> { lock(&self.state).calls.clone() }

    pub fn count(&self, method: &str, url: &str) -> usize {
        let needle = format!("{} {}", method, url);
        lock(&self.state).calls.iter().filter(|c| **c == needle).count()
    }

    /// Watches opened so far as `(collection, since)`.
    pub fn watch_opens(&self) -> Vec<(String, Option<String>)> { lock(&self.state).opens.clone() }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse> {
        let latency = *lock(&self.latency);
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        let key = (req.method().to_string(), req.path());
        let mut st = lock(&self.state);
        st.calls.push(format!("{} {}", req.method(), req.url()));
        if let Some(resp) = st.once.get_mut(&key).and_then(|q| q.pop_front()) {
            return Ok(resp);
        }
        Ok(st
            .sticky
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ApiResponse { status: 404, body: b"404 page not found".to_vec() }))
    }

    async fn open_stream(&self, collection: &str, since: Option<&str>) -> Result<FrameStream> {
        let mut st = lock(&self.state);
        st.opens.push((collection.to_string(), since.map(|s| s.to_string())));
        match st.streams.get_mut(collection).and_then(|q| q.pop_front()) {
            Some(StreamScript::Feed(rx)) => Ok(rx.boxed()),
            Some(StreamScript::Fail(err)) => Err(err),
            // Unscripted watches stay open and silent.
            None => Ok(futures::stream::pending::<Result<Value>>().boxed()),
        }
    }
}

/// Sending half of a scripted watch stream. Dropping it ends the stream.
pub struct WatchFeed {
    tx: mpsc::UnboundedSender<Result<Value>>,
}

impl WatchFeed {
    pub fn send(&self, frame: Value) { let _ = self.tx.unbounded_send(Ok(frame)); }
    pub fn added(&self, object: Value) { self.send(json!({ "type": "ADDED", "object": object })); }
    pub fn modified(&self, object: Value) { self.send(json!({ "type": "MODIFIED", "object": object })); }
    pub fn deleted(&self, object: Value) { self.send(json!({ "type": "DELETED", "object": object })); }

    pub fn bookmark(&self, resource_version: &str) {
        self.send(json!({ "type": "BOOKMARK", "object": { "metadata": { "resourceVersion": resource_version } } }));
    }

    /// In-stream `410 Gone`.
    pub fn gone(&self) {
        self.send(json!({ "type": "ERROR", "object": { "kind": "Status", "code": 410, "reason": "Expired", "message": "too old resource version" } }));
    }

    /// Break the connection below HTTP.
    pub fn fail(&self, message: &str) { let _ = self.tx.unbounded_send(Err(Error::Transport(message.to_string()))); }

    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
}

/// Minimal object JSON with the metadata fields the cache relies on.
pub fn object(uid: &str, name: &str, namespace: Option<&str>, resource_version: &str) -> Value {
    let mut meta = json!({ "uid": uid, "name": name, "resourceVersion": resource_version });
    if let Some(ns) = namespace {
        meta["namespace"] = Value::String(ns.to_string());
    }
    json!({ "metadata": meta })
}

/// List response body.
pub fn list_body(resource_version: &str, items: Vec<Value>) -> Value {
    json!({ "metadata": { "resourceVersion": resource_version }, "items": items })
}
