//! Skerry kubehub: transport boundary, typed REST+watch clients and discovery.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kube::discovery::{Discovery, Scope};
use serde::{Deserialize, Serialize};
use skerry_core::{ApiPrefix, ResourceAddress, ResourceIdentity};
use tracing::info;

mod client;
pub mod mock;
mod transport;
mod util;

pub use client::{AddressIndex, CallOptions, ClientBuilder, ClientId, ListResult, ResourceApiClient, WatchFrame, WatchStream};
pub use transport::{ApiRequest, ApiResponse, FrameStream, KubeTransport, Transport, Verb};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(&self.kind, &self.group, &self.version, &self.plural)
    }

    /// Client for this resource with the well-known fallback addresses attached.
    pub fn client(&self, transport: Arc<dyn Transport>, request_timeout: Duration) -> ResourceApiClient {
        let identity = self.identity();
        let fallbacks = builtin_fallbacks(&identity);
        ResourceApiClient::builder(identity)
            .namespaced(self.namespaced)
            .fallbacks(fallbacks)
            .request_timeout(request_timeout)
            .build(transport)
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: kube::Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    info!(count = out.len(), "discovery complete");
    Ok(out)
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Some((String::new(), (*version).to_string(), (*kind).to_string())),
        [group, version, kind] => Some(((*group).to_string(), (*version).to_string(), (*kind).to_string())),
        _ => None,
    }
}

/// Addresses built-in kinds were served at before their current group/version.
pub fn builtin_fallbacks(identity: &ResourceIdentity) -> Vec<ResourceAddress> {
    let previous: &[&str] = match (identity.group.as_str(), identity.kind.as_str()) {
        ("apps", "Deployment") | ("apps", "DaemonSet") | ("apps", "ReplicaSet") => &["apps/v1beta2", "extensions/v1beta1"],
        ("apps", "StatefulSet") => &["apps/v1beta2", "apps/v1beta1"],
        ("networking.k8s.io", "Ingress") => &["networking.k8s.io/v1beta1", "extensions/v1beta1"],
        ("batch", "CronJob") => &["batch/v1beta1"],
        ("autoscaling", "HorizontalPodAutoscaler") => &["autoscaling/v2beta2", "autoscaling/v2beta1", "autoscaling/v1"],
        ("policy", "PodDisruptionBudget") => &["policy/v1beta1"],
        ("discovery.k8s.io", "EndpointSlice") => &["discovery.k8s.io/v1beta1"],
        _ => &[],
    };
    let current = identity.api_version_with_group();
    previous
        .iter()
        .filter(|gv| **gv != current)
        .map(|gv| ResourceAddress::with_api_version(ApiPrefix::Apis, gv, &identity.plural))
        .collect()
}
