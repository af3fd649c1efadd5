//! Seam to the remote push-capable graph store.
//!
//! ```text
//!            put(path, value) ──────────────►┐
//!            once(path) ────────────────────►│
//!                                            │  RemoteStore
//!  Feed { events, handle } ◄── on(path) ─────┤  (replication, merge and
//!  Feed { events, handle } ◄── map_on(path) ─┘   reconnection live here)
//! ```
//!
//! A `null`/absent value is a tombstone. Acks from `put` report local
//! acceptance, not delivery to peers. Transport failures are the store's
//! business; the sync layer only observes the events it is handed.

pub mod memory;

use agora_core::StorePath;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StoreError;

pub use memory::{MemoryStore, WriteRecord};

/// One pushed change.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    /// For `map_on` feeds: the child key. For `on` feeds: the last path segment.
    pub key: String,
    /// `None` means tombstone.
    pub value: Option<Value>,
}

impl StoreEvent {
    pub fn new(key: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Releases an upstream subscription when switched off.
///
/// `off` consumes the handle, so a feed can be released only once. Dropping
/// an un-released handle releases it as well.
pub struct FeedHandle {
    id: u64,
    path: StorePath,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedHandle {
    pub fn new(id: u64, path: StorePath, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            path,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Unsubscribe from the upstream feed.
    pub fn off(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// A live upstream subscription.
#[derive(Debug)]
pub struct Feed {
    pub events: mpsc::UnboundedReceiver<StoreEvent>,
    pub handle: FeedHandle,
}

/// The remote store client.
///
/// `get(path).put / .once / .on / .map().on` of a push-based graph store.
pub trait RemoteStore: Send + Sync + 'static {
    /// Write `value` at `path`; `None` writes a tombstone.
    fn put<'a>(
        &'a self,
        path: &'a StorePath,
        value: Option<Value>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// One-shot read of the current value.
    fn once<'a>(&'a self, path: &'a StorePath) -> BoxFuture<'a, Result<Option<Value>, StoreError>>;

    /// Live subscription to a single path.
    fn on(&self, path: &StorePath) -> Result<Feed, StoreError>;

    /// Live fan-out subscription to every child under `path`.
    fn map_on(&self, path: &StorePath) -> Result<Feed, StoreError>;
}
