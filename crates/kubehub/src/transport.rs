//! Transport boundary: one-shot requests and line-delimited JSON watch streams.
//! Authentication, TLS and proxying live below this trait.

use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use kube::api::{DeleteParams, GetParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use skerry_core::{ApiStatus, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

impl Verb {
    pub fn method(&self) -> &'static str {
        match self {
            Verb::Get | Verb::List => "GET",
            Verb::Create => "POST",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub verb: Verb,
    /// Collection path, already namespaced when applicable.
    pub collection: String,
    pub name: Option<String>,
    pub body: Option<Vec<u8>>,
    pub limit: Option<u32>,
}

impl ApiRequest {
    fn new(verb: Verb, collection: String, name: Option<&str>, body: Option<Vec<u8>>) -> Self {
        Self { verb, collection, name: name.map(|s| s.to_string()), body, limit: None }
    }

    pub fn get(collection: String, name: &str) -> Self { Self::new(Verb::Get, collection, Some(name), None) }
    pub fn list(collection: String) -> Self { Self::new(Verb::List, collection, None, None) }
    pub fn create(collection: String, body: Vec<u8>) -> Self { Self::new(Verb::Create, collection, None, Some(body)) }
    pub fn patch(collection: String, name: &str, body: Vec<u8>) -> Self { Self::new(Verb::Patch, collection, Some(name), Some(body)) }
    pub fn delete(collection: String, name: &str) -> Self { Self::new(Verb::Delete, collection, Some(name), None) }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn method(&self) -> &'static str { self.verb.method() }

    /// Path without query string.
    pub fn path(&self) -> String {
        match &self.name {
            Some(name) => format!("{}/{}", self.collection, name),
            None => self.collection.clone(),
        }
    }

    pub fn url(&self) -> String {
        match self.limit {
            Some(limit) => format!("{}?limit={}", self.path(), limit),
            None => self.path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    /// Ok for 2xx, otherwise the status classified into the error taxonomy.
    pub fn into_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiStatus::from_body(self.status, &self.body).into_error())
        }
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Raw JSON frames of a watch stream, one per line.
pub type FrameStream = BoxStream<'static, Result<serde_json::Value>>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform a request. Non-2xx answers are returned as responses; `Err` is
    /// reserved for failures below HTTP.
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse>;

    /// Open a watch on `collection`, resuming after `since` when given. A non-2xx
    /// answer on open is classified (`410` becomes [`Error::Stale`]).
    async fn open_stream(&self, collection: &str, since: Option<&str>) -> Result<FrameStream>;
}

/// Transport backed by a kube-rs client (kubeconfig or in-cluster credentials).
#[derive(Clone)]
pub struct KubeTransport {
    client: kube::Client,
}

impl KubeTransport {
    pub fn new(client: kube::Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(kube::Client::try_default().await?))
    }

    pub fn client(&self) -> &kube::Client { &self.client }
}

fn kube_err(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) => ApiStatus { code: ae.code, reason: ae.reason, message: ae.message, details: None }.into_error(),
        other => Error::Transport(other.to_string()),
    }
}

#[async_trait::async_trait]
impl Transport for KubeTransport {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse> {
        let builder = kube::core::Request::new(req.collection.clone());
        let name = req.name.clone().unwrap_or_default();
        let body = req.body.clone().unwrap_or_default();
        let built = match req.verb {
            Verb::Get => builder.get(&name, &GetParams::default()),
            Verb::List => builder.list(&ListParams { limit: req.limit, ..Default::default() }),
            Verb::Create => builder.create(&PostParams::default(), body),
            Verb::Patch => {
                let patch: serde_json::Value = serde_json::from_slice(&body).map_err(|e| Error::Decode(e.to_string()))?;
                builder.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            }
            Verb::Delete => builder.delete(&name, &DeleteParams::default()),
        }
        .map_err(|e| Error::Transport(e.to_string()))?;
        match self.client.request_text(built).await {
            Ok(text) => Ok(ApiResponse { status: 200, body: text.into_bytes() }),
            Err(kube::Error::Api(ae)) => {
                let status = ae.code;
                let body = serde_json::to_vec(&ae).unwrap_or_default();
                Ok(ApiResponse { status, body })
            }
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    async fn open_stream(&self, collection: &str, since: Option<&str>) -> Result<FrameStream> {
        let wp = WatchParams::default();
        let req = kube::core::Request::new(collection)
            .watch(&wp, since.unwrap_or("0"))
            .map_err(|e| Error::Transport(e.to_string()))?;
        let reader = self.client.request_stream(req).await.map_err(kube_err)?;
        let frames = reader
            .lines()
            .filter(|line| futures::future::ready(!matches!(line, Ok(l) if l.trim().is_empty())))
            .map(|line| match line {
                Ok(l) => serde_json::from_str::<serde_json::Value>(&l).map_err(|e| Error::Decode(e.to_string())),
                Err(e) => Err(Error::Transport(e.to_string())),
            });
        Ok(frames.boxed())
    }
}
