//! Subscription multiplexer: at most one upstream feed per target.
//!
//! ```text
//!  subscribe("post", cb1) ─┐
//!  subscribe("post", cb2) ─┼──► registry["post"] ──► CollectionCache ──► map_on(ns/post)
//!  subscribe("post", cb3) ─┘        (refcounted by its subscriber set)
//!
//!  last unsubscribe ──► close cache ──► off() ──► registry entry removed
//! ```
//!
//! The registry follows the get-or-create pattern: a read-locked fast path,
//! then a write-locked double check before opening a feed. Subscribers are
//! attached while the registry lock is held, so a detach racing with an
//! attach can never close a cache someone is joining.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::cache::{CacheStats, CollectionCache, FeedTarget, Snapshot, SnapshotCallback, SubscriberId};
use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::store::RemoteStore;

/// State shared by every clone of a [`Multiplexer`] and, weakly, by its
/// outstanding [`Subscription`]s.
struct MuxInner {
    /// Store every cache opens its feed against
    store: Arc<dyn RemoteStore>,

    /// Namespace, coalescing window and body fields handed to each cache
    config: SyncConfig,

    /// Open caches, at most one per target. Holding the write lock is what
    /// serializes open, close and resync of a feed.
    feeds: RwLock<HashMap<FeedTarget, Arc<CollectionCache>>>,
}

/// Registry of live caches. Clones share the registry.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                store,
                config,
                feeds: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Subscribe to every record of `collection`.
    pub async fn subscribe(
        &self,
        collection: &str,
        callback: SnapshotCallback,
    ) -> Result<Subscription, StoreError> {
        self.subscribe_target(FeedTarget::collection(collection), callback)
            .await
    }

    /// Subscribe to a single record; snapshots hold zero or one record.
    pub async fn subscribe_record(
        &self,
        collection: &str,
        key: &str,
        callback: SnapshotCallback,
    ) -> Result<Subscription, StoreError> {
        self.subscribe_target(FeedTarget::record(collection, key), callback)
            .await
    }

    pub async fn subscribe_target(
        &self,
        target: FeedTarget,
        callback: SnapshotCallback,
    ) -> Result<Subscription, StoreError> {
        let id = SubscriberId::of(&callback);

        // Fast path: read lock
        {
            let feeds = self.inner.feeds.read().await;
            if let Some(cache) = feeds.get(&target) {
                let active = cache.add_subscriber(callback).await;
                debug!("Joined existing feed for {target}");
                return Ok(self.subscription(target, id, active));
            }
        }

        // Slow path: write lock to open the feed
        let mut feeds = self.inner.feeds.write().await;
        // Double-check after acquiring write lock
        let cache = match feeds.get(&target) {
            Some(cache) => cache.clone(),
            None => {
                let cache = Arc::new(CollectionCache::open(
                    self.inner.store.as_ref(),
                    target.clone(),
                    &self.inner.config,
                )?);
                feeds.insert(target.clone(), cache.clone());
                cache
            }
        };
        let active = cache.add_subscriber(callback).await;
        Ok(self.subscription(target, id, active))
    }

    fn subscription(&self, target: FeedTarget, id: SubscriberId, active: Arc<AtomicBool>) -> Subscription {
        Subscription {
            mux: Arc::downgrade(&self.inner),
            target,
            id,
            active,
            released: AtomicBool::new(false),
        }
    }

    /// Remove one subscriber; close and drop the cache if it was the last.
    async fn detach(&self, target: &FeedTarget, id: SubscriberId) {
        let mut feeds = self.inner.feeds.write().await;
        let Some(cache) = feeds.get(target).cloned() else {
            return;
        };
        let remaining = cache.remove_subscriber(id).await;
        debug!("Detached subscriber from {target}; {remaining} remaining");
        if remaining == 0 {
            feeds.remove(target);
            cache.close().await;
        }
    }

    /// Close the collection's feed and reopen it, carrying subscribers over.
    ///
    /// Returns `false` when nobody is subscribed to `collection`.
    pub async fn force_resync(&self, collection: &str) -> Result<bool, StoreError> {
        self.resync_target(&FeedTarget::collection(collection)).await
    }

    /// The old feed is switched off before the new one is issued, so the
    /// store never sees two feeds for `target`. If reopening fails the
    /// registry entry is dropped and its subscriptions become inert.
    pub async fn resync_target(&self, target: &FeedTarget) -> Result<bool, StoreError> {
        let mut feeds = self.inner.feeds.write().await;
        let Some(old) = feeds.remove(target) else {
            return Ok(false);
        };

        let subscribers = old.drain_subscribers().await;
        old.close().await;

        let fresh = match CollectionCache::open(
            self.inner.store.as_ref(),
            target.clone(),
            &self.inner.config,
        ) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                for subscriber in &subscribers {
                    subscriber.deactivate();
                }
                warn!("Reopening {target} failed, {} subscribers dropped: {e}", subscribers.len());
                return Err(e);
            }
        };
        fresh.adopt_subscribers(subscribers).await;
        feeds.insert(target.clone(), fresh);
        info!("Resynced feed for {target}");
        Ok(true)
    }

    /// Number of caches (and upstream feeds) currently open.
    pub async fn open_feed_count(&self) -> usize {
        self.inner.feeds.read().await.len()
    }

    pub async fn is_open(&self, target: &FeedTarget) -> bool {
        self.inner.feeds.read().await.contains_key(target)
    }

    /// Current snapshot of an open collection feed.
    pub async fn snapshot(&self, collection: &str) -> Option<Snapshot> {
        let cache = self.cache(&FeedTarget::collection(collection)).await?;
        Some(cache.snapshot().await)
    }

    pub async fn stats(&self, collection: &str) -> Option<CacheStats> {
        let cache = self.cache(&FeedTarget::collection(collection)).await?;
        Some(cache.stats().await)
    }

    /// Hide `key` from `collection` snapshots until its tombstone arrives.
    ///
    /// Returns `false` if the collection has no open feed or the key is
    /// already hidden.
    pub async fn hide_tentatively(&self, collection: &str, key: &str) -> bool {
        match self.cache(&FeedTarget::collection(collection)).await {
            Some(cache) => cache.hide_tentatively(key).await,
            None => false,
        }
    }

    pub async fn restore_tentative(&self, collection: &str, key: &str) -> bool {
        match self.cache(&FeedTarget::collection(collection)).await {
            Some(cache) => cache.restore_tentative(key).await,
            None => false,
        }
    }

    /// Close every open feed. Outstanding subscriptions become inert.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.inner.feeds.write().await.drain().collect();
        for (target, cache) in drained {
            for subscriber in cache.drain_subscribers().await {
                subscriber.deactivate();
            }
            cache.close().await;
            debug!("Closed {target} during shutdown");
        }
    }

    async fn cache(&self, target: &FeedTarget) -> Option<Arc<CollectionCache>> {
        self.inner.feeds.read().await.get(target).cloned()
    }
}

/// Handle to one registration. Dropping it does not unsubscribe.
#[must_use = "call unsubscribe() to release the feed"]
pub struct Subscription {
    mux: Weak<MuxInner>,
    target: FeedTarget,
    id: SubscriberId,
    active: Arc<AtomicBool>,
    released: AtomicBool,
}

impl Subscription {
    pub fn target(&self) -> &FeedTarget {
        &self.target
    }

    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.active.load(Ordering::Acquire)
    }

    /// Detach the callback. Safe to call more than once.
    pub async fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.mux.upgrade() {
            Some(inner) => Multiplexer { inner }.detach(&self.target, self.id).await,
            None => warn!("Unsubscribe from {} after multiplexer shutdown", self.target),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("target", &self.target)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
