use skerry_core::{ApiPrefix, ObjectRef, ResourceAddress};

use crate::Registry;

/// Naive English plural of a kind: `Ingress` -> `ingresses`, `Policy` -> `policys`.
/// Callers depend on this exact shape, so irregular plurals are left alone.
pub fn guess_plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if kind.ends_with('s') {
        format!("{lower}es")
    } else {
        format!("{lower}s")
    }
}

impl Registry {
    /// Best-effort URL for a loose object reference. Never fails for a non-empty kind:
    ///
    /// 1. a client registered for exactly this kind and apiVersion;
    /// 2. a client registered at the guessed `/apis` or `/api` address;
    /// 3. any client serving the kind, whatever its version;
    /// 4. the guessed `/apis` address, registered or not.
    pub fn lookup_link(&self, reference: &ObjectRef) -> String {
        if reference.kind.is_empty() {
            return String::new();
        }
        let ns = reference.namespace.as_deref();
        let name = reference.name.as_str();

        if let Some(client) = self.lookup_by_kind(&reference.kind, Some(&reference.api_version)) {
            return client.url_for(name, ns);
        }

        let plural = guess_plural(&reference.kind);
        for prefix in [ApiPrefix::Apis, ApiPrefix::Api] {
            let address = ResourceAddress::with_api_version(prefix, &reference.api_version, &plural);
            if let Some(client) = self.client_at(&address) {
                return client.url_for(name, ns);
            }
        }

        if let Some(client) = self.lookup_by_kind(&reference.kind, None) {
            return client.url_for(name, ns);
        }

        ResourceAddress::with_api_version(ApiPrefix::Apis, &reference.api_version, &plural).object_path(ns, name)
    }

    /// Like [`Registry::lookup_link`], defaulting a missing namespace to the referring object's.
    pub fn lookup_link_from(&self, reference: &ObjectRef, parent_namespace: Option<&str>) -> String {
        if reference.namespace.is_some() || parent_namespace.is_none() {
            return self.lookup_link(reference);
        }
        let mut scoped = reference.clone();
        scoped.namespace = parent_namespace.map(str::to_string);
        self.lookup_link(&scoped)
    }
}
