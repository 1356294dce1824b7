//! Keeps one registered client per CustomResourceDefinition.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skerry_core::{ApiPrefix, ResourceAddress, ResourceIdentity, Result, TypedObject};
use skerry_kubehub::{ResourceApiClient, Transport};
use skerry_store::{ListenerId, LoadOptions, ObjectStore, WatchCoordinator, WatchHandle};
use tracing::{info, warn};

use crate::Registry;

/// The parts of a CRD needed to talk to its resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdDefinition {
    pub group: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    /// Storage version if served, else the first served one.
    pub version: String,
    /// Remaining served versions, in declaration order.
    pub other_versions: Vec<String>,
}

impl CrdDefinition {
    /// `None` for definitions without a served version or without names.
    pub fn from_object(obj: &TypedObject) -> Option<Self> {
        let spec = obj.payload.get("spec")?;
        let text = |v: Option<&Value>| v.and_then(|s| s.as_str()).filter(|s| !s.is_empty()).map(str::to_string);
        let group = text(spec.get("group"))?;
        let kind = text(spec.pointer("/names/kind"))?;
        let plural = text(spec.pointer("/names/plural"))?;
        let namespaced = spec.get("scope").and_then(|s| s.as_str()) != Some("Cluster");

        let flag = |v: &Value, key: &str| v.get(key).and_then(|b| b.as_bool()).unwrap_or(false);
        let served: Vec<(String, bool)> = spec
            .get("versions")
            .and_then(|vv| vv.as_array())
            .map(|vv| {
                vv.iter()
                    .filter(|v| flag(v, "served"))
                    .filter_map(|v| text(v.get("name")).map(|name| (name, flag(v, "storage"))))
                    .collect()
            })
            .unwrap_or_default();
        let version = served
            .iter()
            .find(|(_, storage)| *storage)
            .or_else(|| served.first())
            .map(|(name, _)| name.clone())?;
        let other_versions = served.into_iter().map(|(name, _)| name).filter(|name| *name != version).collect();
        Some(Self { group, kind, plural, namespaced, version, other_versions })
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(&self.kind, &self.group, &self.version, &self.plural)
    }

    pub fn fallbacks(&self) -> Vec<ResourceAddress> {
        self.other_versions
            .iter()
            .map(|v| ResourceAddress::new(ApiPrefix::Apis, &self.group, v, &self.plural))
            .collect()
    }

    pub fn client(&self, transport: Arc<dyn Transport>) -> ResourceApiClient {
        ResourceApiClient::builder(self.identity())
            .namespaced(self.namespaced)
            .fallbacks(self.fallbacks())
            .build(transport)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub registered: Vec<String>,
    pub unregistered: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.unregistered.is_empty()
    }
}

struct Managed {
    definition: CrdDefinition,
    client: Arc<ResourceApiClient>,
}

/// Mirrors CustomResourceDefinitions into the registry as they come and go.
pub struct CrdSync {
    registry: Registry,
    transport: Arc<dyn Transport>,
    store: Arc<ObjectStore>,
    with_stores: bool,
    managed: Mutex<FxHashMap<String, Managed>>,
    listener: Mutex<Option<ListenerId>>,
}

impl CrdSync {
    pub fn definitions_client(transport: Arc<dyn Transport>) -> ResourceApiClient {
        ResourceApiClient::builder(ResourceIdentity::new(
            "CustomResourceDefinition",
            "apiextensions.k8s.io",
            "v1",
            "customresourcedefinitions",
        ))
        .namespaced(false)
        .fallback(ResourceAddress::new(ApiPrefix::Apis, "apiextensions.k8s.io", "v1beta1", "customresourcedefinitions"))
        .build(transport)
    }

    /// Registers the definitions client and its store. With `with_stores`, every
    /// custom resource client also gets a store.
    pub fn new(registry: Registry, transport: Arc<dyn Transport>, with_stores: bool) -> Result<Arc<Self>> {
        let client = Arc::new(Self::definitions_client(transport.clone()));
        let store = ObjectStore::new(client.clone());
        registry.register_client(client.clone())?;
        registry.register_store(store.clone(), &client)?;
        Ok(Arc::new(Self {
            registry,
            transport,
            store,
            with_stores,
            managed: Mutex::new(FxHashMap::default()),
            listener: Mutex::new(None),
        }))
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Load definitions, reconcile on every change, and keep watching.
    pub async fn start(self: &Arc<Self>, coordinator: &WatchCoordinator) -> Result<WatchHandle> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.store.on_change(move |_| {
            if let Some(sync) = weak.upgrade() {
                sync.reconcile();
            }
        });
        if let Some(old) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).replace(id) {
            self.store.remove_listener(old);
        }
        self.store.load_and_watch(LoadOptions::default(), coordinator).await
    }

    /// Register clients for new definitions and unregister those whose definition
    /// disappeared or changed shape.
    pub fn reconcile(&self) -> ReconcileReport {
        let mut wanted: FxHashMap<String, CrdDefinition> = FxHashMap::default();
        for obj in self.store.items() {
            match CrdDefinition::from_object(&obj) {
                Some(def) => {
                    wanted.insert(obj.uid().to_string(), def);
                }
                None => warn!(crd = %obj.name(), "crd: definition has no served version; skipped"),
            }
        }

        let mut report = ReconcileReport::default();
        let mut managed = self.managed.lock().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = managed
            .iter()
            .filter(|(uid, m)| wanted.get(*uid) != Some(&m.definition))
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in stale {
            if let Some(m) = managed.remove(&uid) {
                self.registry.unregister_client(&m.client);
                info!(kind = %m.definition.kind, group = %m.definition.group, "crd: client unregistered");
                report.unregistered.push(m.definition.identity().api_version_with_group() + "/" + &m.definition.kind);
            }
        }
        for (uid, def) in wanted {
            if managed.contains_key(&uid) {
                continue;
            }
            let client = Arc::new(def.client(self.transport.clone()));
            if let Err(e) = self.registry.register_client(client.clone()) {
                warn!(kind = %def.kind, group = %def.group, error = %e, "crd: cannot register client");
                continue;
            }
            if self.with_stores {
                if let Err(e) = self.registry.register_store(ObjectStore::new(client.clone()), &client) {
                    warn!(kind = %def.kind, error = %e, "crd: cannot register store");
                }
            }
            info!(kind = %def.kind, group = %def.group, version = %def.version, "crd: client registered");
            report.registered.push(def.identity().api_version_with_group() + "/" + &def.kind);
            managed.insert(uid, Managed { definition: def, client });
        }
        report.registered.sort();
        report.unregistered.sort();
        report
    }

    pub fn managed_clients(&self) -> Vec<Arc<ResourceApiClient>> {
        self.managed.lock().unwrap_or_else(PoisonError::into_inner).values().map(|m| m.client.clone()).collect()
    }
}
