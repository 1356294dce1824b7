//! Network addresses of resource collections (`/api/v1/pods`, `/apis/apps/v1/deployments`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{join_api_version, split_api_version, Error, ResourceIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApiPrefix {
    /// `/api`, the legacy core group.
    Api,
    /// `/apis`, named groups.
    Apis,
}

impl ApiPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiPrefix::Api => "/api",
            ApiPrefix::Apis => "/apis",
        }
    }
}

/// Base path of a resource collection, without namespace or object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceAddress {
    prefix: ApiPrefix,
    group: String,
    version: String,
    plural: String,
}

impl ResourceAddress {
    pub fn new(prefix: ApiPrefix, group: &str, version: &str, plural: &str) -> Self {
        Self { prefix, group: group.to_string(), version: version.to_string(), plural: plural.to_string() }
    }

    /// Canonical address: core kinds under `/api`, grouped kinds under `/apis`.
    pub fn for_identity(identity: &ResourceIdentity) -> Self {
        let prefix = if identity.group.is_empty() { ApiPrefix::Api } else { ApiPrefix::Apis };
        Self::new(prefix, &identity.group, &identity.version, &identity.plural)
    }

    /// Address under an explicit prefix for an `apiVersion` string. The prefix is
    /// taken as given, so `/api` with `apps/v1` yields `/api/apps/v1/...`.
    pub fn with_api_version(prefix: ApiPrefix, api_version: &str, plural: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self::new(prefix, group, version, plural)
    }

    pub fn prefix(&self) -> ApiPrefix { self.prefix }
    pub fn group(&self) -> &str { &self.group }
    pub fn version(&self) -> &str { &self.version }
    pub fn plural(&self) -> &str { &self.plural }

    pub fn api_version_with_group(&self) -> String {
        join_api_version(&self.group, &self.version)
    }

    fn api_path(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.prefix.as_str(), self.version)
        } else {
            format!("{}/{}/{}", self.prefix.as_str(), self.group, self.version)
        }
    }

    /// Collection path, optionally scoped to a namespace.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if !ns.is_empty() => format!("{}/namespaces/{}/{}", self.api_path(), ns, self.plural),
            _ => format!("{}/{}", self.api_path(), self.plural),
        }
    }

    pub fn object_path(&self, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.collection_path(None))
    }
}

/// Parses only bare collection addresses; use [`ParsedUrl`] for object URLs.
impl FromStr for ResourceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = ParsedUrl::parse(s)?;
        if parsed.namespace.is_some() || parsed.name.is_some() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(parsed.address)
    }
}

/// A resource URL broken into its collection address plus optional namespace and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub address: ResourceAddress,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl ParsedUrl {
    /// Accepts `/api/{v}/...` and `/apis/{g}/{v}/...` followed by
    /// `[namespaces/{ns}/]{plural}[/{name}[/{subresource}...]]`. Query strings and
    /// trailing slashes are ignored; subresource segments are dropped.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidAddress(input.to_string());
        let path = input.split('?').next().unwrap_or("");
        let path = path.trim_end_matches('/');
        let segs: Vec<&str> = path.strip_prefix('/').ok_or_else(invalid)?.split('/').collect();
        if segs.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }
        let (prefix, group, version, rest) = match segs.as_slice() {
            ["api", version, rest @ ..] => (ApiPrefix::Api, "", *version, rest),
            ["apis", group, version, rest @ ..] => (ApiPrefix::Apis, *group, *version, rest),
            _ => return Err(invalid()),
        };
        let (namespace, plural, name) = match rest {
            ["namespaces", ns, plural, tail @ ..] => (Some(*ns), *plural, tail.first().copied()),
            [plural, tail @ ..] => (None, *plural, tail.first().copied()),
            [] => return Err(invalid()),
        };
        Ok(Self {
            address: ResourceAddress::new(prefix, group, version, plural),
            namespace: namespace.map(|s| s.to_string()),
            name: name.map(|s| s.to_string()),
        })
    }
}
