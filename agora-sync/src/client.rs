//! Application-facing sync client.
//!
//! Provides:
//! - Live subscriptions to collections, single records and thread levels
//! - Authorized writes on behalf of whoever is signed in at call time
//! - Optimistic removal that hides a record locally until the store confirms
//! - The username directory

use agora_core::{new_key, Record};
use log::debug;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::{CacheStats, Snapshot, SnapshotCallback};
use crate::config::SyncConfig;
use crate::error::{ConfigError, MutationError, StoreError};
use crate::identity::{ActorResolver, UsernameDirectory};
use crate::multiplexer::{Multiplexer, Subscription};
use crate::mutation::{Mutator, RemoveOptions, RemoveOutcome};
use crate::store::RemoteStore;
use crate::thread::{ThreadCallback, ThreadOrder, ThreadView};

/// Sync client over one remote store.
pub struct SyncClient {
    mux: Multiplexer,
    mutator: Mutator,
    usernames: UsernameDirectory,
    actors: Arc<dyn ActorResolver>,
}

impl SyncClient {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        actors: Arc<dyn ActorResolver>,
        config: SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!("Sync client on namespace {}", config.namespace);
        Ok(Self {
            mux: Multiplexer::new(store.clone(), config.clone()),
            mutator: Mutator::new(store.clone(), config.clone()),
            usernames: UsernameDirectory::new(store, config),
            actors,
        })
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn config(&self) -> &SyncConfig {
        self.mux.config()
    }

    // ─── Reads ──────────────────────────────────────────────────

    pub async fn subscribe(
        &self,
        collection: &str,
        callback: SnapshotCallback,
    ) -> Result<Subscription, StoreError> {
        self.mux.subscribe(collection, callback).await
    }

    pub async fn subscribe_record(
        &self,
        collection: &str,
        key: &str,
        callback: SnapshotCallback,
    ) -> Result<Subscription, StoreError> {
        self.mux.subscribe_record(collection, key, callback).await
    }

    pub async fn force_resync(&self, collection: &str) -> Result<bool, StoreError> {
        self.mux.force_resync(collection).await
    }

    pub async fn snapshot(&self, collection: &str) -> Option<Snapshot> {
        self.mux.snapshot(collection).await
    }

    pub async fn stats(&self, collection: &str) -> Option<CacheStats> {
        self.mux.stats(collection).await
    }

    /// Follow the direct replies of `node_key`.
    pub fn open_thread(
        &self,
        node_key: &str,
        order: ThreadOrder,
        callback: ThreadCallback,
    ) -> Result<ThreadView, StoreError> {
        ThreadView::open(&self.mux, node_key, order, callback)
    }

    // ─── Writes ─────────────────────────────────────────────────

    /// Create a record under a fresh key.
    pub async fn create(&self, collection: &str, patch: Value) -> Result<Record, MutationError> {
        self.upsert(collection, &new_key(), patch).await
    }

    pub async fn upsert(
        &self,
        collection: &str,
        key: &str,
        patch: Value,
    ) -> Result<Record, MutationError> {
        let actor = self.actors.current();
        self.mutator.upsert(collection, key, patch, &actor).await
    }

    /// Authorized removal. With `optimistic`, the record disappears from local
    /// snapshots immediately and comes back unless the delete goes through.
    pub async fn remove(
        &self,
        collection: &str,
        key: &str,
        options: RemoveOptions,
    ) -> Result<RemoveOutcome, MutationError> {
        let actor = self.actors.current();
        let hidden = options.optimistic && self.mux.hide_tentatively(collection, key).await;

        let result = self.mutator.remove(collection, key, &actor, options).await;
        if hidden && !matches!(result, Ok(RemoveOutcome::Deleted)) {
            self.mux.restore_tentative(collection, key).await;
        }
        result
    }

    /// Link `child` under `parent` as the current actor, leaving the parent
    /// record itself untouched.
    pub async fn link_child(&self, parent: &str, child: &str, preview: Value) -> Result<(), MutationError> {
        let actor = self.actors.current();
        self.mutator.link_child(parent, child, preview, &actor).await
    }

    pub async fn unlink_child(&self, parent: &str, child: &str) -> Result<RemoveOutcome, MutationError> {
        let actor = self.actors.current();
        self.mutator.unlink_child(parent, child, &actor).await
    }

    pub async fn delete_child_fully(
        &self,
        parent: &str,
        child: &str,
        options: RemoveOptions,
    ) -> Result<RemoveOutcome, MutationError> {
        let actor = self.actors.current();
        self.mutator
            .delete_child_fully(parent, child, &actor, options)
            .await
    }

    // ─── Usernames ──────────────────────────────────────────────

    pub async fn publish_username(&self, alias: &str) -> Result<(), MutationError> {
        let actor = self.actors.current();
        self.usernames.publish(&actor, alias).await
    }

    pub async fn lookup_username(&self, pub_key: &str) -> Result<Option<String>, MutationError> {
        self.usernames.lookup(pub_key).await
    }

    /// Close every open feed.
    pub async fn shutdown(&self) {
        self.mux.close_all().await;
    }
}
