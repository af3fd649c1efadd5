//! Threaded-node traversal: child feeds follow the `directions` index.

use agora_sync::{
    Actor, MemoryStore, Record, RemoveOptions, RemoveOutcome, SharedActor,
    StorePath, SyncClient, SyncConfig, ThreadCallback, ThreadOrder,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn setup(actor: Actor) -> (MemoryStore, SharedActor, SyncClient) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = MemoryStore::new();
    let actors = SharedActor::new(actor);
    let client = SyncClient::new(
        Arc::new(store.clone()),
        Arc::new(actors.clone()),
        SyncConfig::for_testing(),
    )
    .unwrap();
    (store, actors, client)
}

fn path(raw: &str) -> StorePath {
    StorePath::parse(raw).unwrap()
}

/// Thread callback forwarding the ordered child keys.
fn recorder() -> (ThreadCallback, mpsc::UnboundedReceiver<Vec<String>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ThreadCallback = Arc::new(move |children: &[Record]| {
        let _ = tx.send(children.iter().map(|r| r.key.clone()).collect());
    });
    (callback, rx)
}

/// Wait until the published child list equals `expected`.
async fn wait_for(rx: &mut mpsc::UnboundedReceiver<Vec<String>>, expected: &[&str]) {
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut last = None;
    while Instant::now() < deadline {
        match timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Some(keys)) => {
                if keys == expected {
                    return;
                }
                last = Some(keys);
            }
            Ok(None) => break,
            Err(_) => {}
        }
    }
    panic!("children never became {expected:?}; last published {last:?}");
}

async fn reply(client: &SyncClient, parent: &str, key: &str, content: &str, votes: i64) {
    client
        .upsert("node", key, json!({"content": content, "head": parent, "upVotes": votes}))
        .await
        .unwrap();
    client
        .link_child(parent, key, json!({"content": content}))
        .await
        .unwrap();
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_children_follow_directions() {
    let (store, _actors, client) = setup(Actor::authenticated("PK1"));
    client
        .upsert("node", "root", json!({"content": "question"}))
        .await
        .unwrap();
    reply(&client, "root", "r1", "first", 1).await;
    reply(&client, "root", "r2", "second", 3).await;

    let (cb, mut rx) = recorder();
    let view = client.open_thread("root", ThreadOrder::ByVotes, cb).unwrap();
    wait_for(&mut rx, &["r2", "r1"]).await;

    // New reply linked later.
    reply(&client, "root", "r3", "third", 5).await;
    wait_for(&mut rx, &["r3", "r2", "r1"]).await;

    // Unlinking drops the child but keeps its record.
    assert_eq!(
        client.unlink_child("root", "r2").await.unwrap(),
        RemoveOutcome::Deleted
    );
    wait_for(&mut rx, &["r3", "r1"]).await;
    assert!(store.peek(&path("test/node/r2")).is_some());

    view.close().await;
    assert_eq!(store.open_feeds(), 0);
}

#[tokio::test]
async fn test_child_record_updates_reorder_siblings() {
    let (_store, _actors, client) = setup(Actor::authenticated("PK1"));
    reply(&client, "root", "r1", "a", 1).await;
    reply(&client, "root", "r2", "b", 2).await;

    let (cb, mut rx) = recorder();
    let view = client.open_thread("root", ThreadOrder::ByVotes, cb).unwrap();
    wait_for(&mut rx, &["r2", "r1"]).await;

    client
        .upsert("node", "r1", json!({"upVotes": 9}))
        .await
        .unwrap();
    wait_for(&mut rx, &["r1", "r2"]).await;
    view.close().await;
}

#[tokio::test]
async fn test_linked_child_without_record_is_hidden() {
    let (_store, _actors, client) = setup(Actor::authenticated("PK1"));
    reply(&client, "root", "r1", "present", 0).await;
    client.link_child("root", "ghost", json!(true)).await.unwrap();

    let (cb, mut rx) = recorder();
    let view = client.open_thread("root", ThreadOrder::Chronological, cb).unwrap();
    wait_for(&mut rx, &["r1"]).await;
    view.close().await;
}

#[tokio::test]
async fn test_full_delete_removes_child_everywhere() {
    let (store, actors, client) = setup(Actor::authenticated("PKA"));
    client
        .upsert("node", "root", json!({"content": "question"}))
        .await
        .unwrap();
    actors.set(Actor::authenticated("PKB"));
    reply(&client, "root", "r1", "answer", 0).await;
    reply(&client, "root", "r2", "another", 0).await;

    let (cb, mut rx) = recorder();
    let view = client.open_thread("root", ThreadOrder::Chronological, cb).unwrap();
    wait_for(&mut rx, &["r1", "r2"]).await;

    // Parent owner may not fully delete someone else's reply.
    actors.set(Actor::authenticated("PKA"));
    let outcome = client
        .delete_child_fully("root", "r1", RemoveOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, RemoveOutcome::Unauthorized);

    actors.set(Actor::authenticated("PKB"));
    let outcome = client
        .delete_child_fully("root", "r1", RemoveOptions::archived())
        .await
        .unwrap();
    assert_eq!(outcome, RemoveOutcome::Deleted);
    wait_for(&mut rx, &["r2"]).await;
    assert!(store.peek(&path("test/node/r1")).is_none());
    assert!(store.peek(&path("test/archive/r1")).is_some());

    view.close().await;
}

#[tokio::test]
async fn test_deleting_parent_clears_children() {
    let (store, _actors, client) = setup(Actor::authenticated("PK1"));
    client
        .upsert("node", "root", json!({"content": "question"}))
        .await
        .unwrap();
    reply(&client, "root", "r1", "answer", 0).await;

    let (cb, mut rx) = recorder();
    let view = client.open_thread("root", ThreadOrder::ByVotes, cb).unwrap();
    wait_for(&mut rx, &["r1"]).await;

    let outcome = client
        .remove("node", "root", RemoveOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, RemoveOutcome::Deleted);
    wait_for(&mut rx, &[]).await;
    assert!(store.peek(&path("test/node/r1")).is_some());

    view.close().await;
    assert_eq!(store.open_feeds(), 0);
}

#[tokio::test]
async fn test_dropping_view_releases_feeds() {
    let (store, _actors, client) = setup(Actor::authenticated("PK1"));
    reply(&client, "root", "r1", "a", 0).await;

    let (cb, mut rx) = recorder();
    let view = client.open_thread("root", ThreadOrder::ByVotes, cb).unwrap();
    wait_for(&mut rx, &["r1"]).await;
    drop(view);

    let deadline = Instant::now() + Duration::from_secs(1);
    while store.open_feeds() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.open_feeds(), 0);
}
