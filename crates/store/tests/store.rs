#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use skerry_core::{Error, ResourceIdentity, TypedObject, WatchEvent};
use skerry_kubehub::mock::{list_body, object, MockTransport};
use skerry_kubehub::{ResourceApiClient, Transport};
use skerry_store::{ApplyOutcome, ChangeReason, LoadOptions, ObjectStore};
use tokio_util::sync::CancellationToken;

fn pods(mock: &Arc<MockTransport>) -> Arc<ObjectStore> {
    let client = ResourceApiClient::builder(ResourceIdentity::new("Pod", "", "v1", "pods")).build(mock.clone() as Arc<dyn Transport>);
    ObjectStore::new(Arc::new(client))
}

fn pod(uid: &str, name: &str, rv: &str) -> TypedObject {
    TypedObject::from_value(object(uid, name, Some("default"), rv)).unwrap()
}

fn names_and_versions(store: &ObjectStore) -> Vec<(String, String)> {
    store.items().iter().map(|o| (o.name().to_string(), o.resource_version().to_string())).collect()
}

#[tokio::test]
async fn burst_of_events_updates_items_in_stable_order() {
    let mock = Arc::new(MockTransport::new());
    mock.respond(
        "GET",
        "/api/v1/pods",
        200,
        list_body("1", vec![object("ua", "a", Some("default"), "1"), object("ub", "b", Some("default"), "1")]),
    );
    let store = pods(&mock);
    store.load_all(LoadOptions::default()).await.unwrap();
    assert_eq!(store.len(), 2);

    let out = store.apply_events(&[
        WatchEvent::modified(pod("ua", "a", "2")),
        WatchEvent::added(pod("uc", "c", "1")),
        WatchEvent::deleted(pod("ub", "b", "1")),
    ]);
    assert_eq!(out, ApplyOutcome { applied: 3, discarded: 0 });
    assert_eq!(names_and_versions(&store), vec![("a".into(), "2".into()), ("c".into(), "1".into())]);
    assert!(store.get_by_name("b", None).is_none());
    assert!(store.get_by_id("ub").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_loads_share_one_list_request() {
    let mock = Arc::new(MockTransport::new());
    mock.set_latency(Duration::from_millis(50));
    mock.respond("GET", "/api/v1/pods", 200, list_body("7", vec![object("u1", "a", Some("default"), "7")]));
    let store = pods(&mock);

    let (r1, r2) = tokio::join!(store.load_all(LoadOptions::default()), store.load_all(LoadOptions::default()));
    r1.unwrap();
    r2.unwrap();
    assert_eq!(mock.count("GET", "/api/v1/pods"), 1);
    assert!(store.is_loaded());
    assert!(!store.is_loading());
    assert_eq!(store.last_resource_version().as_deref(), Some("7"));
}

#[tokio::test]
async fn stale_modification_is_discarded() {
    let store = pods(&Arc::new(MockTransport::new()));
    store.apply_event(WatchEvent::added(pod("u1", "a", "5")));
    let out = store.apply_event(WatchEvent::modified(pod("u1", "a-renamed", "3")));
    assert_eq!(out, ApplyOutcome { applied: 0, discarded: 1 });
    let current = store.get_by_id("u1").unwrap();
    assert_eq!(current.name(), "a");
    assert_eq!(current.resource_version(), "5");
}

#[tokio::test]
async fn deleting_unknown_uid_is_a_silent_no_op() {
    let store = pods(&Arc::new(MockTransport::new()));
    store.apply_event(WatchEvent::added(pod("u1", "a", "1")));
    let notified = Arc::new(AtomicUsize::new(0));
    let n = notified.clone();
    store.on_change(move |_| {
        n.fetch_add(1, Ordering::SeqCst);
    });
    store.apply_event(WatchEvent::deleted(pod("nope", "zzz", "9")));
    assert_eq!(store.len(), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn uid_stays_unique_across_mixed_events() {
    let store = pods(&Arc::new(MockTransport::new()));
    let mut events = Vec::new();
    for rv in 1..=20u32 {
        let uid = format!("u{}", rv % 4);
        let name = format!("p{}", rv % 3);
        let obj = pod(&uid, &name, &rv.to_string());
        events.push(match rv % 5 {
            0 => WatchEvent::deleted(obj),
            1 => WatchEvent::added(obj),
            _ => WatchEvent::modified(obj),
        });
    }
    for chunk in events.chunks(3) {
        store.apply_events(chunk);
        let mut uids: Vec<String> = store.items().iter().map(|o| o.uid().to_string()).collect();
        let before = uids.len();
        uids.sort();
        uids.dedup();
        assert_eq!(uids.len(), before);
    }
}

#[tokio::test]
async fn failed_reload_keeps_previous_items() {
    let mock = Arc::new(MockTransport::new());
    mock.respond("GET", "/api/v1/pods", 500, json!({"kind": "Status", "code": 500, "message": "etcd unavailable"}));
    mock.respond_once("GET", "/api/v1/pods", 200, list_body("3", vec![object("u1", "a", Some("default"), "3")]));
    let store = pods(&mock);
    store.load_all(LoadOptions::default()).await.unwrap();

    let reasons = Arc::new(std::sync::Mutex::new(Vec::new()));
    let r = reasons.clone();
    store.on_change(move |c| r.lock().unwrap().push(c.reason.clone()));

    let err = store.load_all(LoadOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::Api { code: 500, .. }), "{err:?}");
    assert_eq!(store.len(), 1);
    assert!(store.is_loaded());
    assert!(store.failed_loading());
    assert_eq!(store.last_error(), Some(err.clone()));
    assert_eq!(reasons.lock().unwrap().as_slice(), &[ChangeReason::LoadFailed(err)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_load_resets_flags_without_touching_items() {
    let mock = Arc::new(MockTransport::new());
    let store = pods(&mock);
    store.apply_event(WatchEvent::added(pod("u1", "a", "1")));
    mock.set_latency(Duration::from_secs(5));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = store.load_all(LoadOptions::default().with_cancel(token)).await.unwrap_err();
    assert_eq!(err, Error::Cancelled);

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.is_loading() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("loading flag reset");
    assert!(!store.failed_loading());
    assert!(!store.is_loaded());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn one_notification_per_batch() {
    let store = pods(&Arc::new(MockTransport::new()));
    let notified = Arc::new(AtomicUsize::new(0));
    let n = notified.clone();
    let id = store.on_change(move |_| {
        n.fetch_add(1, Ordering::SeqCst);
    });
    let epoch = store.subscribe_epoch();

    store.apply_events(&[
        WatchEvent::added(pod("u1", "a", "1")),
        WatchEvent::added(pod("u2", "b", "1")),
        WatchEvent::added(pod("u3", "c", "1")),
    ]);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(*epoch.borrow(), store.snapshot().epoch);

    assert!(store.remove_listener(id));
    assert!(!store.remove_listener(id));
    store.apply_event(WatchEvent::added(pod("u4", "d", "1")));
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn optimistic_writes_route_through_apply() {
    let mock = Arc::new(MockTransport::new());
    mock.respond("POST", "/api/v1/namespaces/default/pods", 201, object("u1", "web", Some("default"), "4"));
    mock.respond("PATCH", "/api/v1/namespaces/default/pods/web", 200, object("u1", "web", Some("default"), "5"));
    mock.respond("DELETE", "/api/v1/namespaces/default/pods/web", 200, object("u1", "web", Some("default"), "6"));
    let store = pods(&mock);

    let created = store.create(Some("default"), json!({"metadata": {"name": "web"}})).await.unwrap();
    assert_eq!(created.uid(), "u1");
    assert_eq!(store.len(), 1);
    // Local writes must not move the watch resume point.
    assert_eq!(store.last_resource_version(), None);

    let patched = store.patch("web", Some("default"), json!({"metadata": {"labels": {"a": "b"}}})).await.unwrap();
    assert_eq!(patched.map(|o| o.resource_version().to_string()).as_deref(), Some("5"));

    assert!(store.remove("web", Some("default")).await.unwrap());
    assert!(store.is_empty());
}
