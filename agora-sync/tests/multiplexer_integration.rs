//! Feed multiplexing and snapshot emission against the in-memory store.
//!
//! Verifies:
//! - At most one upstream feed per collection
//! - A burst of pushes inside one window yields one emission
//! - Unchanged pushes are dropped, tombstones remove records
//! - Teardown switches the feed off once; re-subscribing opens a new one
//! - Late joiners, duplicate callbacks, panicking subscribers, resync

use agora_sync::{
    Multiplexer, RemoteStore, MemoryStore, Snapshot, SnapshotCallback, StorePath, SyncConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup() -> (MemoryStore, Multiplexer) {
    init_logging();
    let store = MemoryStore::new();
    let mux = Multiplexer::new(Arc::new(store.clone()), SyncConfig::for_testing());
    (store, mux)
}

fn path(raw: &str) -> StorePath {
    StorePath::parse(raw).unwrap()
}

/// Callback that forwards every snapshot into a channel.
fn recorder() -> (SnapshotCallback, mpsc::UnboundedReceiver<Snapshot>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: SnapshotCallback = Arc::new(move |snapshot: &Snapshot| {
        let _ = tx.send(snapshot.clone());
    });
    (callback, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Snapshot>) -> Snapshot {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("expected an emission")
        .expect("recorder closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Snapshot>) {
    assert!(
        timeout(Duration::from_millis(60), rx.recv()).await.is_err(),
        "unexpected emission"
    );
}

async fn put(store: &MemoryStore, raw: &str, value: Option<Value>) {
    store.put(&path(raw), value).await.unwrap();
}

// ─── Feed sharing ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_at_most_one_feed_per_collection() {
    let (store, mux) = setup();
    let (cb1, _rx1) = recorder();
    let (cb2, _rx2) = recorder();
    let (cb3, _rx3) = recorder();

    let s1 = mux.subscribe("post", cb1).await.unwrap();
    let s2 = mux.subscribe("post", cb2).await.unwrap();
    let s3 = mux.subscribe("post", cb3).await.unwrap();

    assert_eq!(store.open_feeds_at(&path("test/post")), 1);
    assert_eq!(store.feeds_opened(), 1);

    s1.unsubscribe().await;
    s2.unsubscribe().await;
    assert_eq!(store.open_feeds_at(&path("test/post")), 1);
    s3.unsubscribe().await;
    assert_eq!(store.open_feeds(), 0);
}

#[tokio::test]
async fn test_concurrent_subscribes_share_one_feed() {
    let (store, mux) = setup();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let mux = mux.clone();
        handles.push(tokio::spawn(async move {
            let (cb, _rx) = recorder();
            mux.subscribe("post", cb).await.unwrap()
        }));
    }
    let mut subs = Vec::new();
    for handle in handles {
        subs.push(handle.await.unwrap());
    }

    assert_eq!(store.feeds_opened(), 1);
    assert_eq!(mux.open_feed_count().await, 1);
    for sub in &subs {
        sub.unsubscribe().await;
    }
    assert_eq!(store.off_calls(), 1);
}

// ─── Emission ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_burst_coalesces_into_one_emission() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe("post", cb).await.unwrap();

    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    put(&store, "test/post/p1", Some(json!({"content": "World"}))).await;
    put(&store, "test/post/p1", Some(json!({"timestamp": 10}))).await;
    put(&store, "test/post/p2", Some(json!({"title": "Second", "timestamp": 20}))).await;
    put(&store, "test/post/p1", Some(json!({"title": "Hello"}))).await;

    let snapshot = next(&mut rx).await;
    assert_eq!(snapshot.keys(), vec!["p2", "p1"]);
    let p1 = snapshot.get("p1").unwrap();
    assert_eq!(p1.str_field("title"), Some("Hello"));
    assert_eq!(p1.str_field("content"), Some("World"));
    assert_quiet(&mut rx).await;

    let stats = mux.stats("post").await.unwrap();
    assert_eq!(stats.events_received, 5);
    assert_eq!(stats.emissions, 1);
}

#[tokio::test]
async fn test_identical_push_is_deduplicated() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe("post", cb).await.unwrap();

    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    next(&mut rx).await;

    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    assert_quiet(&mut rx).await;
    assert_eq!(mux.stats("post").await.unwrap().events_deduplicated, 1);
}

#[tokio::test]
async fn test_tombstone_removes_record() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe("post", cb).await.unwrap();

    put(&store, "test/post/p1", Some(json!({"title": "a", "timestamp": 1}))).await;
    put(&store, "test/post/p2", Some(json!({"title": "b", "timestamp": 2}))).await;
    assert_eq!(next(&mut rx).await.keys(), vec!["p2", "p1"]);

    put(&store, "test/post/p1", None).await;
    assert_eq!(next(&mut rx).await.keys(), vec!["p2"]);
}

#[tokio::test]
async fn test_malformed_records_are_filtered() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe("post", cb).await.unwrap();

    put(&store, "test/post/blank", Some(json!({"title": "   "}))).await;
    put(&store, "test/post/untitled", Some(json!({"content": "no title"}))).await;
    put(&store, "test/post/scalar", Some(json!("junk"))).await;
    put(&store, "test/post/ok", Some(json!({"title": "fine"}))).await;

    assert_eq!(next(&mut rx).await.keys(), vec!["ok"]);
    assert!(mux.stats("post").await.unwrap().malformed_filtered >= 3);
}

#[tokio::test]
async fn test_newest_first_with_legacy_date() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe("post", cb).await.unwrap();

    put(&store, "test/post/old", Some(json!({"title": "a", "timestamp": 100}))).await;
    put(&store, "test/post/legacy", Some(json!({"title": "b", "date": "250"}))).await;
    put(&store, "test/post/new", Some(json!({"title": "c", "timestamp": 300}))).await;
    put(&store, "test/post/undated", Some(json!({"title": "d"}))).await;

    assert_eq!(next(&mut rx).await.keys(), vec!["new", "legacy", "old", "undated"]);
}

// ─── Subscribers ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_teardown_and_resubscribe() {
    let (store, mux) = setup();
    let (cb, _rx) = recorder();
    let sub = mux.subscribe("post", cb.clone()).await.unwrap();
    sub.unsubscribe().await;

    assert_eq!(store.off_calls(), 1);
    assert_eq!(store.open_feeds(), 0);
    assert_eq!(mux.open_feed_count().await, 0);

    let again = mux.subscribe("post", cb).await.unwrap();
    assert_eq!(store.feeds_opened(), 2);
    assert_eq!(store.open_feeds(), 1);
    again.unsubscribe().await;
    assert_eq!(store.off_calls(), 2);
}

#[tokio::test]
async fn test_same_callback_registered_once() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let first = mux.subscribe("post", cb.clone()).await.unwrap();
    let _second = mux.subscribe("post", cb).await.unwrap();

    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    next(&mut rx).await;
    assert_quiet(&mut rx).await;

    // One registration: releasing it releases the feed.
    first.unsubscribe().await;
    assert_eq!(store.open_feeds(), 0);
}

#[tokio::test]
async fn test_late_joiner_gets_current_snapshot() {
    let (store, mux) = setup();
    let (early, mut early_rx) = recorder();
    let _a = mux.subscribe("post", early).await.unwrap();
    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    next(&mut early_rx).await;

    let (late, mut late_rx) = recorder();
    let _b = mux.subscribe("post", late).await.unwrap();
    let replay = late_rx.try_recv().expect("replayed synchronously on subscribe");
    assert_eq!(replay.keys(), vec!["p1"]);
}

#[tokio::test]
async fn test_existing_data_emitted_to_first_subscriber() {
    let (store, mux) = setup();
    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;

    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe("post", cb).await.unwrap();
    assert_eq!(next(&mut rx).await.keys(), vec!["p1"]);
}

#[tokio::test]
async fn test_unsubscribe_inside_window_skips_pending_emission() {
    let (store, mux) = setup();
    let (leaving, mut leaving_rx) = recorder();
    let (staying, mut staying_rx) = recorder();
    let a = mux.subscribe("post", leaving).await.unwrap();
    let _b = mux.subscribe("post", staying).await.unwrap();

    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    a.unsubscribe().await;

    next(&mut staying_rx).await;
    assert_quiet(&mut leaving_rx).await;
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_starve_others() {
    let (store, mux) = setup();
    let bad: SnapshotCallback = Arc::new(|_: &Snapshot| panic!("subscriber failure"));
    let (good, mut rx) = recorder();
    let _a = mux.subscribe("post", bad).await.unwrap();
    let _b = mux.subscribe("post", good).await.unwrap();

    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    assert_eq!(next(&mut rx).await.keys(), vec!["p1"]);
    assert_eq!(mux.stats("post").await.unwrap().subscriber_panics, 1);
}

#[tokio::test]
async fn test_force_resync_carries_subscribers() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let sub = mux.subscribe("post", cb).await.unwrap();
    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    next(&mut rx).await;

    assert!(mux.force_resync("post").await.unwrap());
    assert_eq!(store.off_calls(), 1);
    assert_eq!(store.feeds_opened(), 2);
    assert_eq!(store.open_feeds(), 1);

    // Fresh feed replays what the store holds.
    assert_eq!(next(&mut rx).await.keys(), vec!["p1"]);

    sub.unsubscribe().await;
    assert_eq!(store.open_feeds(), 0);
}

#[tokio::test]
async fn test_record_subscription_sees_only_its_record() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe_record("post", "p1", cb).await.unwrap();

    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    let snapshot = next(&mut rx).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.records()[0].key, "p1");

    put(&store, "test/post/p2", Some(json!({"title": "Other"}))).await;
    assert_quiet(&mut rx).await;

    put(&store, "test/post/p1", None).await;
    assert!(next(&mut rx).await.is_empty());
}

#[tokio::test]
async fn test_tentative_overlay_reconciled_by_tombstone() {
    let (store, mux) = setup();
    let (cb, mut rx) = recorder();
    let _sub = mux.subscribe("post", cb).await.unwrap();
    put(&store, "test/post/p1", Some(json!({"title": "Hi"}))).await;
    next(&mut rx).await;

    assert!(mux.hide_tentatively("post", "p1").await);
    assert!(next(&mut rx).await.is_empty());

    put(&store, "test/post/p1", None).await;
    assert!(next(&mut rx).await.is_empty());

    // Overlay entry is gone: a re-created record shows up again.
    put(&store, "test/post/p1", Some(json!({"title": "Back"}))).await;
    assert_eq!(next(&mut rx).await.keys(), vec!["p1"]);
}
