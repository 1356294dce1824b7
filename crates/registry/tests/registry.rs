#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use skerry_core::{ApiPrefix, Error, ObjectRef, ResourceAddress, ResourceIdentity, TypedObject, WatchEvent};
use skerry_kubehub::mock::{list_body, MockTransport};
use skerry_kubehub::{CallOptions, ResourceApiClient, Transport};
use skerry_registry::{CrdSync, Registry};
use skerry_store::{ObjectStore, WatchConfig, WatchCoordinator};

fn transport() -> Arc<dyn Transport> {
    Arc::new(MockTransport::new())
}

fn deployments(transport: Arc<dyn Transport>) -> Arc<ResourceApiClient> {
    Arc::new(ResourceApiClient::builder(ResourceIdentity::new("Deployment", "apps", "v1", "deployments")).build(transport))
}

fn pods(transport: Arc<dyn Transport>) -> Arc<ResourceApiClient> {
    Arc::new(ResourceApiClient::builder(ResourceIdentity::new("Pod", "", "v1", "pods")).build(transport))
}

#[test]
fn duplicate_address_is_rejected_and_first_client_kept() {
    let reg = Registry::new();
    let first = deployments(transport());
    let second = deployments(transport());
    reg.register_client(first.clone()).unwrap();
    let err = reg.register_client(second.clone()).unwrap_err();
    assert_eq!(err, Error::AddressConflict("/apis/apps/v1/deployments".into()));
    let found = reg.lookup_client("/apis/apps/v1/deployments").unwrap();
    assert_eq!(found.id(), first.id());
    assert_eq!(reg.clients().len(), 1);
    // Re-registering the same client is also a conflict.
    assert!(reg.register_client(first).is_err());
}

#[test]
fn one_store_per_client() {
    let reg = Registry::new();
    let client = pods(transport());
    reg.register_client(client.clone()).unwrap();
    reg.register_store(ObjectStore::new(client.clone()), &client).unwrap();
    let err = reg.register_store(ObjectStore::new(client.clone()), &client).unwrap_err();
    assert!(matches!(err, Error::StoreConflict(_)), "{err:?}");

    let other = deployments(transport());
    let err = reg.register_store(ObjectStore::new(client.clone()), &other).unwrap_err();
    assert!(matches!(err, Error::Mismatch(_)), "{err:?}");
}

#[test]
fn unregister_drops_address_and_store() {
    let reg = Registry::new();
    let client = pods(transport());
    reg.register_client(client.clone()).unwrap();
    reg.register_store(ObjectStore::new(client.clone()), &client).unwrap();
    assert!(reg.unregister_client(&client));
    assert!(!reg.unregister_client(&client));
    assert!(reg.lookup_client("/api/v1/pods").is_none());
    assert!(reg.store_for(&client).is_none());
    // The address is free again.
    reg.register_client(pods(transport())).unwrap();
}

#[test]
fn lookup_client_accepts_object_urls_and_rejects_garbage() {
    let reg = Registry::new();
    let client = deployments(transport());
    reg.register_client(client.clone()).unwrap();
    let by_url = reg.lookup_client("/apis/apps/v1/namespaces/default/deployments/web").unwrap();
    assert_eq!(by_url.id(), client.id());
    // Other version of the same group and plural resolves through the predicate.
    let by_predicate = reg.lookup_client("/apis/apps/v1beta2/deployments").unwrap();
    assert_eq!(by_predicate.id(), client.id());
    assert!(reg.lookup_client("not a url").is_none());
    assert!(reg.lookup_client("/apis//v1/x").is_none());
    assert!(reg.lookup_client("/apis/batch/v1/jobs").is_none());
}

#[test]
fn link_for_registered_kind_and_version() {
    let reg = Registry::new();
    reg.register_client(deployments(transport())).unwrap();
    let link = reg.lookup_link(&ObjectRef::new("Deployment", "apps/v1", "web", Some("default")));
    assert_eq!(link, "/apis/apps/v1/namespaces/default/deployments/web");
}

#[test]
fn link_for_old_api_version_falls_back_to_kind() {
    let reg = Registry::new();
    reg.register_client(deployments(transport())).unwrap();
    let link = reg.lookup_link(&ObjectRef::new("Deployment", "extensions/v1beta1", "web", Some("default")));
    assert_eq!(link, "/apis/apps/v1/namespaces/default/deployments/web");
}

#[test]
fn link_through_guessed_address_and_parent_namespace() {
    let reg = Registry::new();
    // Kind differs from the reference, so only the guessed address can match.
    let client = Arc::new(
        ResourceApiClient::builder(ResourceIdentity::new("IngressV2", "networking.k8s.io", "v1", "ingresses")).build(transport()),
    );
    reg.register_client(client).unwrap();
    let reference = ObjectRef::new("Ingress", "networking.k8s.io/v1", "edge", None);
    assert_eq!(reg.lookup_link_from(&reference, Some("web")), "/apis/networking.k8s.io/v1/namespaces/web/ingresses/edge");

    let cluster_scoped = Arc::new(
        ResourceApiClient::builder(ResourceIdentity::new("Node", "", "v1", "nodes")).namespaced(false).build(transport()),
    );
    reg.register_client(cluster_scoped).unwrap();
    let node = ObjectRef::new("Node", "v1", "n1", None);
    assert_eq!(reg.lookup_link_from(&node, Some("web")), "/api/v1/nodes/n1");
}

#[test]
fn link_is_total_for_well_formed_references() {
    let reg = Registry::new();
    reg.register_client(pods(transport())).unwrap();
    for (kind, api_version) in [("Pod", "v1"), ("Widget", "example.com/v1"), ("Policy", "v1"), ("Status", "meta/v1")] {
        let link = reg.lookup_link(&ObjectRef::new(kind, api_version, "x", Some("ns")));
        assert!(!link.is_empty(), "{kind} {api_version}");
        assert!(link.ends_with("/x"), "{link}");
    }
}

#[tokio::test]
async fn fallback_rewrite_repoints_the_index() {
    let mock = Arc::new(MockTransport::new());
    mock.respond_text("GET", "/apis/apps/v1/deployments", 404, "404 page not found");
    mock.respond("GET", "/apis/extensions/v1beta1/deployments", 200, list_body("3", vec![]));
    let client = Arc::new(
        ResourceApiClient::builder(ResourceIdentity::new("Deployment", "apps", "v1", "deployments"))
            .fallback(ResourceAddress::with_api_version(ApiPrefix::Apis, "extensions/v1beta1", "deployments"))
            .build(mock.clone() as Arc<dyn Transport>),
    );
    let reg = Registry::new();
    reg.register_client(client.clone()).unwrap();

    client.list(None, &CallOptions::default()).await.unwrap();
    assert_eq!(client.current_address().to_string(), "/apis/extensions/v1beta1/deployments");
    let via_old = reg.lookup_client("/apis/apps/v1/deployments").unwrap();
    let via_new = reg.lookup_client("/apis/extensions/v1beta1/deployments").unwrap();
    assert_eq!(via_old.id(), client.id());
    assert_eq!(via_new.id(), client.id());

    // Links now point at the address that works.
    let link = reg.lookup_link(&ObjectRef::new("Deployment", "apps/v1", "web", Some("default")));
    assert_eq!(link, "/apis/extensions/v1beta1/namespaces/default/deployments/web");

    // A new client may claim the vacated address; the alias yields to it.
    let replacement = deployments(mock.clone() as Arc<dyn Transport>);
    reg.register_client(replacement.clone()).unwrap();
    assert_eq!(reg.lookup_client("/apis/apps/v1/deployments").unwrap().id(), replacement.id());
}

#[test]
fn explicit_repoint_refuses_taken_address() {
    let reg = Registry::new();
    let a = deployments(transport());
    let b = Arc::new(
        ResourceApiClient::builder(ResourceIdentity::new("Deployment", "extensions", "v1beta1", "deployments")).build(transport()),
    );
    reg.register_client(a.clone()).unwrap();
    reg.register_client(b.clone()).unwrap();
    let err = reg.repoint(&a, &b.current_address()).unwrap_err();
    assert!(matches!(err, Error::AddressConflict(_)));
    assert_eq!(reg.lookup_client("/apis/apps/v1/deployments").unwrap().id(), a.id());
}

fn widget_crd(uid: &str, rv: &str, storage: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"uid": uid, "name": "widgets.example.com", "resourceVersion": rv},
        "spec": {
            "group": "example.com",
            "names": {"kind": "Widget", "plural": "widgets"},
            "scope": "Namespaced",
            "versions": [
                {"name": "v1beta1", "served": true, "storage": storage == "v1beta1"},
                {"name": "v1", "served": true, "storage": storage == "v1"}
            ]
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crd_clients_follow_definitions() {
    let mock = Arc::new(MockTransport::new());
    mock.respond(
        "GET",
        "/apis/apiextensions.k8s.io/v1/customresourcedefinitions",
        200,
        list_body("5", vec![widget_crd("c1", "5", "v1")]),
    );
    let feed = mock.push_watch("/apis/apiextensions.k8s.io/v1/customresourcedefinitions");
    let reg = Registry::new();
    let coord = WatchCoordinator::new(WatchConfig { batch_window: Duration::from_millis(2), ..WatchConfig::default() });
    let sync = CrdSync::new(reg.clone(), mock.clone() as Arc<dyn Transport>, true).unwrap();
    let _watch = sync.start(&coord).await.unwrap();

    let widget = reg.lookup_client("/apis/example.com/v1/widgets").expect("widget client registered");
    assert_eq!(widget.fallback_addresses().len(), 1);
    assert!(reg.store_for(&widget).is_some());
    assert_eq!(sync.managed_clients().len(), 1);
    assert_eq!(
        reg.lookup_link(&ObjectRef::new("Widget", "example.com/v1", "w", Some("team"))),
        "/apis/example.com/v1/namespaces/team/widgets/w"
    );

    feed.deleted(widget_crd("c1", "6", "v1"));
    tokio::time::timeout(Duration::from_secs(3), async {
        while reg.lookup_client("/apis/example.com/v1/widgets").is_some() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("widget client unregistered");
    assert!(reg.store_for(&widget).is_none());
    assert!(sync.managed_clients().is_empty());
    // The definitions client itself stays.
    assert!(reg.lookup_client("/apis/apiextensions.k8s.io/v1/customresourcedefinitions").is_some());
}

#[test]
fn changed_storage_version_replaces_the_client() {
    let reg = Registry::new();
    let sync = CrdSync::new(reg.clone(), transport(), false).unwrap();
    let store = sync.store();
    store.apply_event(WatchEvent::added(TypedObject::from_value(widget_crd("c1", "1", "v1beta1")).unwrap()));
    let report = sync.reconcile();
    assert_eq!(report.registered, vec!["example.com/v1beta1/Widget".to_string()]);
    assert!(reg.lookup_client("/apis/example.com/v1beta1/widgets").is_some());
    assert!(sync.reconcile().is_empty());

    store.apply_event(WatchEvent::modified(TypedObject::from_value(widget_crd("c1", "2", "v1")).unwrap()));
    let report = sync.reconcile();
    assert_eq!(report.unregistered, vec!["example.com/v1beta1/Widget".to_string()]);
    assert_eq!(report.registered, vec!["example.com/v1/Widget".to_string()]);
    let current = reg.lookup_by_kind("Widget", None).unwrap();
    assert_eq!(current.api_version_with_group(), "example.com/v1");
    assert_eq!(reg.clients().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rewrite_racing_registration_still_lands_in_the_index() {
    for _ in 0..50 {
        let mock = Arc::new(MockTransport::new());
        mock.respond_text("GET", "/apis/apps/v1/deployments", 404, "404 page not found");
        mock.respond("GET", "/apis/extensions/v1beta1/deployments", 200, list_body("3", vec![]));
        let client = Arc::new(
            ResourceApiClient::builder(ResourceIdentity::new("Deployment", "apps", "v1", "deployments"))
                .fallback(ResourceAddress::with_api_version(ApiPrefix::Apis, "extensions/v1beta1", "deployments"))
                .build(mock.clone() as Arc<dyn Transport>),
        );
        let reg = Registry::new();
        let lister = {
            let client = client.clone();
            tokio::spawn(async move { client.list(None, &CallOptions::default()).await })
        };
        reg.register_client(client.clone()).unwrap();
        lister.await.unwrap().unwrap();

        // The working address is taken by the rewritten client whichever side won.
        let rival = Arc::new(
            ResourceApiClient::builder(ResourceIdentity::new("Deployment", "extensions", "v1beta1", "deployments"))
                .build(mock.clone() as Arc<dyn Transport>),
        );
        let err = reg.register_client(rival).unwrap_err();
        assert_eq!(err, Error::AddressConflict("/apis/extensions/v1beta1/deployments".into()));
    }
}
