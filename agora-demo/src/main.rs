//! Walkthrough of the sync layer against the in-memory store.
//!
//! Usage: `agora-demo [config.json]`. Set `RUST_LOG=debug` to watch feed
//! lifecycles and delete phases.

use agora_sync::{
    Actor, MemoryStore, Record, RemoveOptions, SharedActor, Snapshot, SyncClient, SyncConfig,
    ThreadOrder,
};
use log::info;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

type DemoResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> DemoResult {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => SyncConfig::load(&path)?,
        None => SyncConfig::default(),
    };
    let settle = config.coalesce_window() * 3;
    info!("Starting agora demo on namespace {}", config.namespace);

    let store = MemoryStore::new();
    let actors = SharedActor::new(Actor::authenticated("PK1"));
    let client = SyncClient::new(Arc::new(store.clone()), Arc::new(actors.clone()), config)?;

    posts(&client, &actors, settle).await?;
    thread(&client, &actors, settle).await?;

    client.shutdown().await;
    info!("Done; {} feeds still open", store.open_feeds());
    Ok(())
}

async fn posts(client: &SyncClient, actors: &SharedActor, settle: Duration) -> DemoResult {
    let feed = client
        .subscribe(
            "post",
            Arc::new(|snapshot: &Snapshot| {
                let titles: Vec<&str> = snapshot
                    .iter()
                    .filter_map(|r| r.str_field("title"))
                    .collect();
                println!("post feed v{}: {titles:?}", snapshot.version());
            }),
        )
        .await?;

    client
        .upsert("post", "p1", json!({"title": "Hi", "content": "World"}))
        .await?;
    client.publish_username("alice").await?;
    tokio::time::sleep(settle).await;

    actors.set(Actor::authenticated("PK2"));
    let outcome = client.remove("post", "p1", RemoveOptions::archived()).await?;
    println!("PK2 removing p1: {outcome:?}");

    actors.set(Actor::authenticated("PK1"));
    let outcome = client
        .remove("post", "p1", RemoveOptions::archived().optimistic())
        .await?;
    println!("PK1 removing p1: {outcome:?}");
    tokio::time::sleep(settle).await;

    let author = client.lookup_username("PK1").await?;
    println!("PK1 is known as {author:?}");

    feed.unsubscribe().await;
    Ok(())
}

async fn thread(client: &SyncClient, actors: &SharedActor, settle: Duration) -> DemoResult {
    actors.set(Actor::guest("bob"));
    let root = client
        .create("node", json!({"content": "Which runtime?"}))
        .await?;

    for (content, votes) in [("tokio", 4), ("smol", 1), ("async-std", 2)] {
        let reply = client
            .create("node", json!({"content": content, "head": root.key, "upVotes": votes}))
            .await?;
        client
            .link_child(&root.key, &reply.key, json!({"content": content}))
            .await?;
    }

    let view = client.open_thread(
        &root.key,
        ThreadOrder::ByVotes,
        Arc::new(|children: &[Record]| {
            let replies: Vec<&str> = children
                .iter()
                .filter_map(|r| r.str_field("content"))
                .collect();
            println!("replies: {replies:?}");
        }),
    )?;
    tokio::time::sleep(settle).await;

    view.close().await;
    Ok(())
}
