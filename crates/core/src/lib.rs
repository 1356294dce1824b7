//! Skerry core types: resource identities, addresses, cached objects and watch events.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod address;
mod config;
mod error;

pub use address::{ApiPrefix, ParsedUrl, ResourceAddress};
pub use config::Config;
pub use error::{ApiStatus, Error, Result, StatusDetails};

pub mod prelude {
    pub use super::{
        ApiPrefix, Config, Error, EventKind, ObjectMeta, ObjectRef, ResourceAddress,
        ResourceIdentity, Result, TypedObject, WatchEvent,
    };
}

/// Immutable description of a resource kind as declared by the application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub kind: String,
    /// Empty for the core group.
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl ResourceIdentity {
    pub fn new(kind: &str, group: &str, version: &str, plural: &str) -> Self {
        Self {
            kind: kind.to_string(),
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
        }
    }

    /// Build from an `apiVersion` string such as `apps/v1` or `v1`.
    pub fn from_api_version(kind: &str, api_version: &str, plural: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self::new(kind, group, version, plural)
    }

    pub fn api_version_with_group(&self) -> String {
        join_api_version(&self.group, &self.version)
    }
}

/// Split `group/version` into its parts; a bare version belongs to the core group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

pub fn join_api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

/// Closed set of metadata fields every object carries. Anything else the server
/// sends under `metadata` is kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub uid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: String,
    #[serde(rename = "creationTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A remote object instance. Resource specific fields stay in the opaque `payload`;
/// typed accessors are layered on top by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedObject {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl TypedObject {
    /// Decode a raw API object. `metadata.uid` and `metadata.name` are required.
    pub fn from_value(mut raw: serde_json::Value) -> Result<Self> {
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);
        let obj: TypedObject = serde_json::from_value(raw).map_err(|e| Error::Decode(e.to_string()))?;
        if obj.metadata.uid.is_empty() {
            return Err(Error::Decode(format!("object {} has an empty metadata.uid", obj.metadata.name)));
        }
        Ok(obj)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn uid(&self) -> &str { &self.metadata.uid }
    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref() }
    pub fn resource_version(&self) -> &str { &self.metadata.resource_version }

    /// Look up a payload field by JSON pointer, e.g. `/spec/replicas`.
    pub fn field(&self, pointer: &str) -> Option<&serde_json::Value> {
        let rest = pointer.strip_prefix('/')?;
        let (head, tail) = match rest.split_once('/') {
            Some((h, t)) => (h, Some(t)),
            None => (rest, None),
        };
        let top = self.payload.get(head)?;
        match tail {
            Some(t) => top.pointer(&format!("/{}", t)),
            None => Some(top),
        }
    }

    /// Creation time as unix seconds, 0 when absent or malformed.
    pub fn creation_ts(&self) -> i64 {
        self.metadata
            .creation_timestamp
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0)
    }

    pub fn labels(&self) -> SmallVec<[(String, String); 8]> {
        let mut out = SmallVec::new();
        if let Some(map) = self.metadata.extra.get("labels").and_then(|v| v.as_object()) {
            for (k, v) in map.iter() {
                if let Some(val) = v.as_str() {
                    out.push((k.clone(), val.to_string()));
                }
            }
        }
        out
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Order two resourceVersions. Versions are opaque to the server contract; numeric
/// tokens compare numerically, anything else is only comparable for equality.
pub fn compare_resource_versions(a: &str, b: &str) -> Option<Ordering> {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => Some(x.cmp(&y)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

/// True only when `candidate` is provably older than `current`.
pub fn is_older_version(candidate: &str, current: &str) -> bool {
    matches!(compare_resource_versions(candidate, current), Some(Ordering::Less))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub object: TypedObject,
}

impl WatchEvent {
    pub fn added(object: TypedObject) -> Self { Self { kind: EventKind::Added, object } }
    pub fn modified(object: TypedObject) -> Self { Self { kind: EventKind::Modified, object } }
    pub fn deleted(object: TypedObject) -> Self { Self { kind: EventKind::Deleted, object } }
}

/// Loose reference to an object, e.g. an event's involved object or an owner reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn new(kind: &str, api_version: &str, name: &str, namespace: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            name: name.to_string(),
            namespace: namespace.map(|s| s.to_string()),
        }
    }
}
