//! In-process graph store with push semantics.
//!
//! Behaves like the remote store as far as the sync layer can observe:
//!
//! - `put` deep-merges objects into the tree; `None` leaves a `null` tombstone
//! - every watcher whose path overlaps the write receives an event, the writer
//!   included
//! - `on` replays the current value, `map_on` replays every current child
//!
//! It also records writes and feed lifecycles so tests can check call order
//! and feed counts.

use agora_core::StorePath;
use futures_util::future::BoxFuture;
use log::trace;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{Feed, FeedHandle, RemoteStore, StoreEvent};
use crate::error::StoreError;

/// One attempted write, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub path: StorePath,
    pub value: Option<Value>,
    /// `false` when the write was rejected.
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchMode {
    Value,
    Children,
}

struct Watcher {
    path: StorePath,
    mode: WatchMode,
    tx: mpsc::UnboundedSender<StoreEvent>,
    /// Children last reported live, so a wholesale removal of the watched
    /// path can tombstone each of them
    live_children: BTreeSet<String>,
}

#[derive(Default)]
struct MemoryInner {
    root: Map<String, Value>,
    watchers: BTreeMap<u64, Watcher>,
    next_feed_id: u64,
    feeds_opened: u64,
    off_calls: u64,
    writes: Vec<WriteRecord>,
    rejected_prefixes: Vec<StorePath>,
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

fn lock(inner: &Mutex<MemoryInner>) -> MutexGuard<'_, MemoryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value at `path` without going through a feed.
    pub fn peek(&self, path: &StorePath) -> Option<Value> {
        lookup(&lock(&self.inner).root, path)
    }

    /// Every write attempted so far, in order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        lock(&self.inner).writes.clone()
    }

    pub fn clear_write_log(&self) {
        lock(&self.inner).writes.clear();
    }

    /// Feeds currently open.
    pub fn open_feeds(&self) -> usize {
        lock(&self.inner).watchers.len()
    }

    /// Feeds currently open on exactly `path`.
    pub fn open_feeds_at(&self, path: &StorePath) -> usize {
        lock(&self.inner)
            .watchers
            .values()
            .filter(|w| &w.path == path)
            .count()
    }

    /// Feeds ever opened.
    pub fn feeds_opened(&self) -> u64 {
        lock(&self.inner).feeds_opened
    }

    /// Times a feed handle was switched off.
    pub fn off_calls(&self) -> u64 {
        lock(&self.inner).off_calls
    }

    /// Reject subsequent writes at or below `path`.
    pub fn reject_writes_under(&self, path: StorePath) {
        lock(&self.inner).rejected_prefixes.push(path);
    }

    pub fn accept_all_writes(&self) {
        lock(&self.inner).rejected_prefixes.clear();
    }

    fn apply_put(&self, path: &StorePath, value: Option<Value>) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        let rejected = inner.rejected_prefixes.iter().any(|p| path.starts_with(p));
        inner.writes.push(WriteRecord {
            path: path.clone(),
            value: value.clone(),
            accepted: !rejected,
        });
        if rejected {
            return Err(StoreError::Rejected {
                path: path.to_string(),
                reason: "writes disabled for path".to_string(),
            });
        }

        write_at(&mut inner.root, path, value);
        notify(&mut inner, path);
        trace!("put {path}");
        Ok(())
    }

    fn read(&self, path: &StorePath) -> Option<Value> {
        lookup(&lock(&self.inner).root, path)
    }

    fn subscribe(&self, path: &StorePath, mode: WatchMode) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_feed_id;
        inner.next_feed_id += 1;
        inner.feeds_opened += 1;

        // Initial replay of what is already there.
        let mut live_children = BTreeSet::new();
        match mode {
            WatchMode::Value => {
                if let Some(value) = lookup(&inner.root, path) {
                    let _ = tx.send(StoreEvent::new(path.last(), Some(value)));
                }
            }
            WatchMode::Children => {
                if let Some(Value::Object(children)) = value_at(&inner.root, path) {
                    for (key, value) in children {
                        let value = non_null(value);
                        if value.is_some() {
                            live_children.insert(key.clone());
                        }
                        let _ = tx.send(StoreEvent::new(key.clone(), value));
                    }
                }
            }
        }

        inner.watchers.insert(
            id,
            Watcher {
                path: path.clone(),
                mode,
                tx,
                live_children,
            },
        );
        drop(inner);

        let weak = Arc::downgrade(&self.inner);
        let handle = FeedHandle::new(id, path.clone(), move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = lock(&inner);
                inner.off_calls += 1;
                inner.watchers.remove(&id);
            }
        });
        Feed { events: rx, handle }
    }
}

impl RemoteStore for MemoryStore {
    fn put<'a>(
        &'a self,
        path: &'a StorePath,
        value: Option<Value>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.apply_put(path, value) })
    }

    fn once<'a>(&'a self, path: &'a StorePath) -> BoxFuture<'a, Result<Option<Value>, StoreError>> {
        Box::pin(async move { Ok(self.read(path)) })
    }

    fn on(&self, path: &StorePath) -> Result<Feed, StoreError> {
        Ok(self.subscribe(path, WatchMode::Value))
    }

    fn map_on(&self, path: &StorePath) -> Result<Feed, StoreError> {
        Ok(self.subscribe(path, WatchMode::Children))
    }
}

// ─── Tree helpers ───────────────────────────────────────────────

fn value_at<'a>(root: &'a Map<String, Value>, path: &StorePath) -> Option<&'a Value> {
    let mut segments = path.segments();
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn non_null(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        other => Some(other.clone()),
    }
}

/// Value at `path`, with `null` reported as absent.
fn lookup(root: &Map<String, Value>, path: &StorePath) -> Option<Value> {
    value_at(root, path).and_then(non_null)
}

fn write_at(root: &mut Map<String, Value>, path: &StorePath, value: Option<Value>) {
    let segments: Vec<&str> = path.segments().collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        let slot = node
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        node = match slot.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }

    match value {
        None => {
            node.insert(last.to_string(), Value::Null);
        }
        Some(Value::Object(incoming)) => {
            if let Some(Value::Object(existing)) = node.get_mut(*last) {
                merge(existing, incoming);
                return;
            }
            node.insert(last.to_string(), Value::Object(incoming));
        }
        Some(other) => {
            node.insert(last.to_string(), other);
        }
    }
}

/// Field-wise merge, recursing into nested objects.
fn merge(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match value {
            Value::Object(nested) => {
                if let Some(Value::Object(current)) = existing.get_mut(&key) {
                    merge(current, nested);
                    continue;
                }
                existing.insert(key, Value::Object(nested));
            }
            other => {
                existing.insert(key, other);
            }
        }
    }
}

/// Push the effect of a write at `written` to every overlapping watcher.
fn notify(inner: &mut MemoryInner, written: &StorePath) {
    let MemoryInner { root, watchers, .. } = inner;
    let root: &Map<String, Value> = root;
    watchers.retain(|_, watcher| match watcher.mode {
        WatchMode::Value => {
            if !written.starts_with(&watcher.path) && !watcher.path.starts_with(written) {
                return true;
            }
            let event = StoreEvent::new(watcher.path.last(), lookup(root, &watcher.path));
            watcher.tx.send(event).is_ok()
        }
        WatchMode::Children => {
            if let Some(child) = written.child_segment_under(&watcher.path) {
                let value = value_at(root, &watcher.path)
                    .and_then(|v| v.get(child))
                    .and_then(non_null);
                return watcher.send_child(child.to_string(), value);
            }
            if !watcher.path.starts_with(written) {
                return true;
            }
            watcher.resend_children(value_at(root, &watcher.path))
        }
    });
}

impl Watcher {
    fn send_child(&mut self, key: String, value: Option<Value>) -> bool {
        if value.is_some() {
            self.live_children.insert(key.clone());
        } else {
            self.live_children.remove(&key);
        }
        self.tx.send(StoreEvent::new(key, value)).is_ok()
    }

    /// The watched path itself or an ancestor was written: report every
    /// current child, and a tombstone for each live child that is gone.
    fn resend_children(&mut self, current: Option<&Value>) -> bool {
        let children = match current {
            Some(Value::Object(children)) => Some(children),
            _ => None,
        };
        let vanished: Vec<String> = self
            .live_children
            .iter()
            .filter(|key| children.and_then(|c| c.get(*key)).and_then(non_null).is_none())
            .cloned()
            .collect();
        for key in vanished {
            if !self.send_child(key, None) {
                return false;
            }
        }
        children.into_iter().flatten().all(|(key, value)| {
            let value = non_null(value);
            self.send_child(key.clone(), value)
        })
    }
}
