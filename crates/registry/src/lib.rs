//! Skerry registry: which client serves which address, and which store belongs to
//! which client. Construct one per process (or per test) and pass it around.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use rustc_hash::FxHashMap;
use skerry_core::{Error, ParsedUrl, ResourceAddress, Result};
use skerry_kubehub::{AddressIndex, ClientId, ResourceApiClient};
use skerry_store::ObjectStore;
use tracing::{debug, error, info};

mod crd;
mod link;

pub use crd::{CrdDefinition, CrdSync, ReconcileReport};
pub use link::guess_plural;

#[derive(Default)]
struct Maps {
    /// Registration order; lookups that scan return the earliest match.
    clients: Vec<Arc<ResourceApiClient>>,
    by_address: FxHashMap<ResourceAddress, Arc<ResourceApiClient>>,
    /// Addresses a client answered at before a fallback rewrite.
    aliases: FxHashMap<ResourceAddress, ClientId>,
    stores: FxHashMap<ClientId, Arc<ObjectStore>>,
}

impl Maps {
    fn by_id(&self, id: ClientId) -> Option<&Arc<ResourceApiClient>> {
        self.clients.iter().find(|c| c.id() == id)
    }

    fn at(&self, address: &ResourceAddress) -> Option<&Arc<ResourceApiClient>> {
        self.by_address
            .get(address)
            .or_else(|| self.aliases.get(address).and_then(|id| self.by_id(*id)))
    }

    fn address_of(&self, id: ClientId) -> Option<ResourceAddress> {
        self.by_address.iter().find(|(_, c)| c.id() == id).map(|(a, _)| a.clone())
    }

    fn move_client(&mut self, client: &ResourceApiClient, to: &ResourceAddress) -> Result<()> {
        let Some(from) = self.address_of(client.id()) else {
            return Err(Error::NotFound(format!("{} is not registered", client.id())));
        };
        if from == *to {
            return Ok(());
        }
        if let Some(other) = self.by_address.get(to) {
            if other.id() != client.id() {
                return Err(Error::AddressConflict(to.to_string()));
            }
        }
        if let Some(entry) = self.by_address.remove(&from) {
            self.by_address.insert(to.clone(), entry);
        }
        self.aliases.remove(to);
        self.aliases.insert(from, client.id());
        Ok(())
    }
}

struct Inner {
    maps: RwLock<Maps>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AddressIndex for Inner {
    fn repoint(&self, client: &ResourceApiClient, from: &ResourceAddress, to: &ResourceAddress) {
        match self.write().move_client(client, to) {
            Ok(()) => info!(client = %client.id(), from = %from, to = %to, "registry: client repointed"),
            Err(Error::NotFound(_)) => debug!(client = %client.id(), "registry: repoint for unregistered client ignored"),
            Err(e) => error!(client = %client.id(), from = %from, to = %to, error = %e, "registry: cannot repoint client"),
        }
    }
}

/// Process-wide index of clients and stores. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let maps = self.inner.read();
        f.debug_struct("Registry")
            .field("clients", &maps.clients.len())
            .field("stores", &maps.stores.len())
            .field("aliases", &maps.aliases.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { maps: RwLock::new(Maps::default()) }) }
    }

    /// Index `client` under its current address. A taken address is a wiring bug.
    pub fn register_client(&self, client: Arc<ResourceApiClient>) -> Result<()> {
        let mut maps = self.inner.write();
        if maps.by_id(client.id()).is_some() {
            let address = client.current_address();
            error!(address = %address, kind = %client.kind(), "registry: client already registered");
            return Err(Error::AddressConflict(address.to_string()));
        }
        // Attach before reading the address: a rewrite that misses the index has
        // already stored its target, and one that sees it blocks on this lock.
        let index: Weak<dyn AddressIndex> = Arc::downgrade(&self.inner) as Weak<dyn AddressIndex>;
        client.attach_index(index);
        let address = client.current_address();
        if maps.by_address.contains_key(&address) {
            client.detach_index();
            error!(address = %address, kind = %client.kind(), "registry: address already registered");
            return Err(Error::AddressConflict(address.to_string()));
        }
        maps.aliases.remove(&address);
        maps.by_address.insert(address.clone(), client.clone());
        maps.clients.push(client);
        debug!(address = %address, "registry: client registered");
        Ok(())
    }

    /// Bind `store` to `client`. Each client gets at most one store.
    pub fn register_store(&self, store: Arc<ObjectStore>, client: &ResourceApiClient) -> Result<()> {
        if store.client().id() != client.id() {
            return Err(Error::Mismatch(format!(
                "store for {} cannot be bound to {} ({})",
                store.client().id(),
                client.id(),
                client.current_address()
            )));
        }
        let mut maps = self.inner.write();
        if maps.stores.contains_key(&client.id()) {
            error!(client = %client.id(), address = %client.current_address(), "registry: client already has a store");
            return Err(Error::StoreConflict(client.current_address().to_string()));
        }
        maps.stores.insert(client.id(), store);
        Ok(())
    }

    /// Drop the client, its aliases and its store. Returns whether it was registered.
    pub fn unregister_client(&self, client: &ResourceApiClient) -> bool {
        let id = client.id();
        let present = {
            let mut maps = self.inner.write();
            let before = maps.clients.len();
            maps.clients.retain(|c| c.id() != id);
            maps.by_address.retain(|_, c| c.id() != id);
            maps.aliases.retain(|_, cid| *cid != id);
            maps.stores.remove(&id);
            maps.clients.len() != before
        };
        if present {
            client.detach_index();
            debug!(client = %id, kind = %client.kind(), "registry: client unregistered");
        }
        present
    }

    /// Move `client` to `to` in the address index, keeping its old address as an alias.
    pub fn repoint(&self, client: &ResourceApiClient, to: &ResourceAddress) -> Result<()> {
        self.inner.write().move_client(client, to)
    }

    /// Resolve an address or object URL. Exact (or previous) address first, then any
    /// client serving the same group and plural. Unparsable input is `None`.
    pub fn lookup_client(&self, address: &str) -> Option<Arc<ResourceApiClient>> {
        let parsed = ParsedUrl::parse(address).ok()?;
        let maps = self.inner.read();
        if let Some(client) = maps.at(&parsed.address) {
            return Some(client.clone());
        }
        let want = &parsed.address;
        maps.clients
            .iter()
            .find(|c| {
                let cur = c.current_address();
                cur.plural() == want.plural() && cur.group() == want.group()
            })
            .cloned()
    }

    /// First registered client (in registration order) matching `pred`.
    pub fn find_client<F>(&self, pred: F) -> Option<Arc<ResourceApiClient>>
    where
        F: Fn(&ResourceApiClient) -> bool,
    {
        self.inner.read().clients.iter().find(|c| pred(c)).cloned()
    }

    /// By kind, optionally pinned to an `apiVersion` (`group/version` or `version`).
    pub fn lookup_by_kind(&self, kind: &str, api_version: Option<&str>) -> Option<Arc<ResourceApiClient>> {
        self.find_client(|c| c.kind() == kind && api_version.map(|v| c.api_version_with_group() == v).unwrap_or(true))
    }

    pub(crate) fn client_at(&self, address: &ResourceAddress) -> Option<Arc<ResourceApiClient>> {
        self.inner.read().at(address).cloned()
    }

    pub fn store_for(&self, client: &ResourceApiClient) -> Option<Arc<ObjectStore>> {
        self.inner.read().stores.get(&client.id()).cloned()
    }

    pub fn store_for_address(&self, address: &str) -> Option<Arc<ObjectStore>> {
        let client = self.lookup_client(address)?;
        self.store_for(&client)
    }

    pub fn clients(&self) -> Vec<Arc<ResourceApiClient>> {
        self.inner.read().clients.clone()
    }

    pub fn stores(&self) -> Vec<Arc<ObjectStore>> {
        let maps = self.inner.read();
        maps.clients.iter().filter_map(|c| maps.stores.get(&c.id()).cloned()).collect()
    }

    pub fn is_registered(&self, client: &ResourceApiClient) -> bool {
        self.inner.read().by_id(client.id()).is_some()
    }
}
