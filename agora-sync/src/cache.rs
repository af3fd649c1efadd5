//! Canonical local view of one upstream feed.
//!
//! ```text
//!  RemoteStore feed ──► worker task ──► CacheState.entries (canonical map)
//!  (one per target)        │                   │
//!                          │ first change arms │
//!                          ▼ the window        ▼
//!                   coalescing timer ──► Snapshot (sorted, filtered copy)
//!                                              │
//!                              ┌───────────────┼───────────────┐
//!                              ▼               ▼               ▼
//!                         subscriber      subscriber      subscriber
//! ```
//!
//! The store may deliver one event per changed field; the fixed window turns a
//! burst of them into a single emission carrying the latest full state.
//! Subscribers only ever see immutable snapshots, never the live map, and
//! never a snapshot older than one they already received.
//!
//! Performance target: 100 pushes inside one window produce one emission

use agora_core::{field, PathError, Record, StorePath};
use log::{debug, error, info, trace};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::store::{Feed, FeedHandle, RemoteStore, StoreEvent};

/// Receives every emitted snapshot of a feed.
pub type SnapshotCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// What a cache mirrors: a whole collection, or one record of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedTarget {
    Collection(String),
    Record { collection: String, key: String },
}

impl FeedTarget {
    pub fn collection(name: impl Into<String>) -> Self {
        FeedTarget::Collection(name.into())
    }

    pub fn record(collection: impl Into<String>, key: impl Into<String>) -> Self {
        FeedTarget::Record {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn collection_name(&self) -> &str {
        match self {
            FeedTarget::Collection(name) => name,
            FeedTarget::Record { collection, .. } => collection,
        }
    }

    pub fn path(&self, config: &SyncConfig) -> Result<StorePath, PathError> {
        match self {
            FeedTarget::Collection(name) => config.collection_path(name),
            FeedTarget::Record { collection, key } => config.record_path(collection, key),
        }
    }
}

impl fmt::Display for FeedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedTarget::Collection(name) => write!(f, "{name}"),
            FeedTarget::Record { collection, key } => write!(f, "{collection}/{key}"),
        }
    }
}

// ─── Snapshots ──────────────────────────────────────────────────

/// Immutable, sorted view of every well-formed record at emission time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    target: FeedTarget,
    version: u64,
    records: Arc<[Record]>,
}

impl Snapshot {
    pub fn new(target: FeedTarget, version: u64, records: Vec<Record>) -> Self {
        Self {
            target,
            version,
            records: records.into(),
        }
    }

    pub fn empty(target: FeedTarget) -> Self {
        Self::new(target, 0, Vec::new())
    }

    pub fn target(&self) -> &FeedTarget {
        &self.target
    }

    /// Count of canonical changes folded into this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Newest first.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.key.as_str()).collect()
    }
}

/// Turn canonical entries into emitted records: drop hidden and malformed
/// entries, sort newest first. Returns the records and the malformed count.
pub fn materialize<'a>(
    entries: impl IntoIterator<Item = (&'a String, &'a Value)>,
    hidden: &HashSet<String>,
    body_field: Option<&str>,
) -> (Vec<Record>, usize) {
    let mut malformed = 0;
    let mut records: Vec<Record> = entries
        .into_iter()
        .filter(|(key, _)| !hidden.contains(*key))
        .filter_map(|(key, value)| {
            match Record::from_value(key.clone(), value.clone()) {
                Some(record) if record.is_well_formed(body_field) => Some(record),
                _ => {
                    trace!("Filtered malformed record {key}");
                    malformed += 1;
                    None
                }
            }
        })
        .collect();
    records.sort_by(Record::newest_first);
    (records, malformed)
}

// ─── Subscribers ────────────────────────────────────────────────

/// Identity of a registered callback (its `Arc` allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(usize);

impl SubscriberId {
    pub fn of(callback: &SnapshotCallback) -> Self {
        Self(Arc::as_ptr(callback) as *const () as usize)
    }
}

/// One registered callback. Clones share the liveness flag and delivery
/// high-water mark.
#[derive(Clone)]
pub(crate) struct Subscriber {
    /// Identity used for dedup and removal
    id: SubscriberId,

    /// The view's callback
    callback: SnapshotCallback,

    /// Cleared on unsubscribe or shutdown; shared with the `Subscription`
    active: Arc<AtomicBool>,

    /// Highest snapshot version handed to `callback`
    delivered: Arc<AtomicU64>,
}

impl Subscriber {
    fn new(callback: SnapshotCallback) -> Self {
        Self {
            id: SubscriberId::of(&callback),
            callback,
            active: Arc::new(AtomicBool::new(true)),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Invoke the callback, containing any panic to this subscriber.
    ///
    /// A snapshot older than one already delivered is skipped: the replay to
    /// a late joiner can race the worker's next emission.
    fn deliver(&self, snapshot: &Snapshot, stats: &AtomicCacheStats) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let seen = self.delivered.fetch_max(snapshot.version(), Ordering::AcqRel);
        if seen > snapshot.version() {
            trace!(
                "Skipped stale v{} of {} for {:?}; v{seen} already delivered",
                snapshot.version(),
                snapshot.target(),
                self.id
            );
            return;
        }
        let callback = &self.callback;
        if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
            stats.subscriber_panics.fetch_add(1, Ordering::Relaxed);
            error!(
                "Subscriber {:?} on {} panicked; remaining subscribers still notified",
                self.id,
                snapshot.target()
            );
        }
    }
}

// ─── Stats ──────────────────────────────────────────────────────

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub events_received: u64,
    pub events_deduplicated: u64,
    pub emissions: u64,
    pub malformed_filtered: u64,
    pub subscriber_panics: u64,
    pub records: usize,
    pub subscribers: usize,
}

/// Hot-path counters, read via [`CollectionCache::stats`].
#[derive(Default)]
struct AtomicCacheStats {
    events_received: AtomicU64,
    events_deduplicated: AtomicU64,
    emissions: AtomicU64,
    malformed_filtered: AtomicU64,
    subscriber_panics: AtomicU64,
}

// ─── State ──────────────────────────────────────────────────────

/// Everything the worker and the cache's callers share under one lock.
struct CacheState {
    /// key → value with `key` injected
    entries: HashMap<String, Value>,

    /// Tentatively removed keys, hidden until their tombstone arrives
    hidden: HashSet<String>,

    /// Registered callbacks, in registration order
    subscribers: Vec<Subscriber>,

    /// Bumped on every change that alters the next snapshot
    version: u64,

    /// Upstream subscription; taken exactly once by `close`
    feed: Option<FeedHandle>,

    closed: bool,
}

impl CacheState {
    fn new(feed: FeedHandle) -> Self {
        Self {
            entries: HashMap::new(),
            hidden: HashSet::new(),
            subscribers: Vec::new(),
            version: 0,
            feed: Some(feed),
            closed: false,
        }
    }

    /// Fold one push event into the canonical map.
    ///
    /// Returns whether an emission should be scheduled.
    fn apply(&mut self, event: StoreEvent, stats: &AtomicCacheStats) -> bool {
        let StoreEvent { key, value } = event;
        match value {
            None => {
                self.hidden.remove(&key);
                if self.entries.remove(&key).is_some() {
                    self.version += 1;
                }
                true
            }
            Some(value) => {
                let value = with_key(value, &key);
                if self.entries.get(&key) == Some(&value) {
                    stats.events_deduplicated.fetch_add(1, Ordering::Relaxed);
                    trace!("Dropped unchanged event for {key}");
                    return false;
                }
                self.entries.insert(key, value);
                self.version += 1;
                true
            }
        }
    }

    fn has_data(&self) -> bool {
        self.version > 0
    }

    fn snapshot(
        &self,
        target: &FeedTarget,
        body_field: Option<&str>,
        stats: &AtomicCacheStats,
    ) -> Snapshot {
        let (records, malformed) = materialize(&self.entries, &self.hidden, body_field);
        stats
            .malformed_filtered
            .fetch_add(malformed as u64, Ordering::Relaxed);
        Snapshot::new(target.clone(), self.version, records)
    }
}

fn with_key(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert(field::KEY.to_string(), Value::String(key.to_string()));
            Value::Object(map)
        }
        other => other,
    }
}

// ─── Cache ──────────────────────────────────────────────────────

/// One open upstream feed plus its canonical map and subscribers.
///
/// Created and torn down by the [`Multiplexer`](crate::multiplexer::Multiplexer).
pub struct CollectionCache {
    /// What this cache mirrors (registry key)
    target: FeedTarget,

    /// Store path the feed was issued on
    path: StorePath,

    /// Text field a record must carry to be emitted
    body_field: Option<String>,

    /// Canonical map, overlay and subscribers
    state: Arc<Mutex<CacheState>>,

    /// Arms the coalescing window for changes made outside the worker
    wake: Arc<Notify>,

    /// Lock-free counters
    stats: Arc<AtomicCacheStats>,

    /// The feed worker; aborted on close and on drop
    task: JoinHandle<()>,
}

impl CollectionCache {
    /// Issue the upstream subscription and start the worker task.
    pub(crate) fn open(
        store: &dyn RemoteStore,
        target: FeedTarget,
        config: &SyncConfig,
    ) -> Result<Self, StoreError> {
        let path = target.path(config)?;
        let Feed { events, handle } = match &target {
            FeedTarget::Collection(_) => store.map_on(&path)?,
            FeedTarget::Record { .. } => store.on(&path)?,
        };

        let state = Arc::new(Mutex::new(CacheState::new(handle)));
        let wake = Arc::new(Notify::new());
        let stats = Arc::new(AtomicCacheStats::default());
        let body_field = config
            .body_field(target.collection_name())
            .map(str::to_string);

        let worker = FeedWorker {
            target: target.clone(),
            body_field: body_field.clone(),
            window: config.coalesce_window(),
            state: state.clone(),
            wake: wake.clone(),
            stats: stats.clone(),
        };
        let task = tokio::spawn(worker.run(events));
        info!("Opened feed for {target} at {path}");

        Ok(Self {
            target,
            path,
            body_field,
            state,
            wake,
            stats,
            task,
        })
    }

    pub fn target(&self) -> &FeedTarget {
        &self.target
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Register `callback`; replay the current snapshot if the cache has data.
    ///
    /// Registering the same callback twice keeps a single registration.
    /// Returns the registration's liveness flag.
    pub(crate) async fn add_subscriber(&self, callback: SnapshotCallback) -> Arc<AtomicBool> {
        let id = SubscriberId::of(&callback);
        let (subscriber, replay) = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.subscribers.iter().find(|s| s.id == id) {
                return existing.active.clone();
            }
            let subscriber = Subscriber::new(callback);
            state.subscribers.push(subscriber.clone());
            let replay = state
                .has_data()
                .then(|| state.snapshot(&self.target, self.body_field.as_deref(), &self.stats));
            (subscriber, replay)
        };
        if let Some(snapshot) = replay {
            subscriber.deliver(&snapshot, &self.stats);
        }
        subscriber.active.clone()
    }

    /// Detach a callback. Returns the number of subscribers left.
    pub(crate) async fn remove_subscriber(&self, id: SubscriberId) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|s| {
            if s.id == id {
                s.deactivate();
                false
            } else {
                true
            }
        });
        state.subscribers.len()
    }

    /// Take every subscriber, leaving them active, for hand-over to a new cache.
    pub(crate) async fn drain_subscribers(&self) -> Vec<Subscriber> {
        std::mem::take(&mut self.state.lock().await.subscribers)
    }

    /// Attach subscribers drained from a closed cache. Versions restart with
    /// this cache, so their delivery marks are reset.
    pub(crate) async fn adopt_subscribers(&self, subscribers: Vec<Subscriber>) {
        let mut state = self.state.lock().await;
        for subscriber in subscribers {
            subscriber.delivered.store(0, Ordering::Release);
            if state.subscribers.iter().all(|s| s.id != subscriber.id) {
                state.subscribers.push(subscriber);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    /// Current snapshot, built on demand.
    pub async fn snapshot(&self) -> Snapshot {
        self.state
            .lock()
            .await
            .snapshot(&self.target, self.body_field.as_deref(), &self.stats)
    }

    /// Hide `key` from emitted snapshots until its tombstone arrives.
    pub async fn hide_tentatively(&self, key: &str) -> bool {
        let inserted = {
            let mut state = self.state.lock().await;
            let inserted = state.hidden.insert(key.to_string());
            if inserted {
                state.version += 1;
            }
            inserted
        };
        if inserted {
            debug!("Tentatively hid {key} in {}", self.target);
            self.wake.notify_one();
        }
        inserted
    }

    /// Undo [`hide_tentatively`](Self::hide_tentatively), e.g. after a rejected delete.
    pub async fn restore_tentative(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.hidden.remove(key);
            if removed {
                state.version += 1;
            }
            removed
        };
        if removed {
            debug!("Restored {key} in {}", self.target);
            self.wake.notify_one();
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_deduplicated: self.stats.events_deduplicated.load(Ordering::Relaxed),
            emissions: self.stats.emissions.load(Ordering::Relaxed),
            malformed_filtered: self.stats.malformed_filtered.load(Ordering::Relaxed),
            subscriber_panics: self.stats.subscriber_panics.load(Ordering::Relaxed),
            records: state.entries.len(),
            subscribers: state.subscribers.len(),
        }
    }

    /// Cancel any pending emission, switch the upstream feed off, drop the map.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.task.abort();
        let feed = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.clear();
            state.hidden.clear();
            state.feed.take()
        };
        if let Some(feed) = feed {
            feed.off();
        }
        info!("Closed feed for {} at {}", self.target, self.path);
    }
}

impl Drop for CollectionCache {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─── Worker ─────────────────────────────────────────────────────

/// The cache's single logical thread: applies events, runs the window.
struct FeedWorker {
    /// For logs and snapshot labels
    target: FeedTarget,

    /// Same as the owning cache's
    body_field: Option<String>,

    /// Fixed delay between the first change of a burst and its emission
    window: Duration,

    /// Shared with the owning cache
    state: Arc<Mutex<CacheState>>,

    /// Signalled by the cache when the overlay changes
    wake: Arc<Notify>,

    /// Shared with the owning cache
    stats: Arc<AtomicCacheStats>,
}

impl FeedWorker {
    async fn run(self, mut events: mpsc::UnboundedReceiver<StoreEvent>) {
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Upstream feed for {} ended", self.target);
                        break;
                    };
                    self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                    let changed = self.state.lock().await.apply(event, &self.stats);
                    if changed && deadline.is_none() {
                        deadline = Some(Instant::now() + self.window);
                    }
                }
                _ = self.wake.notified() => {
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + self.window);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.emit().await;
                }
            }
        }

        if deadline.is_some() {
            self.emit().await;
        }
    }

    async fn emit(&self) {
        let (snapshot, subscribers) = {
            let state = self.state.lock().await;
            if state.closed {
                return;
            }
            let snapshot = state.snapshot(&self.target, self.body_field.as_deref(), &self.stats);
            (snapshot, state.subscribers.clone())
        };

        self.stats.emissions.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Emitting {} records of {} to {} subscribers",
            snapshot.len(),
            self.target,
            subscribers.len()
        );
        for subscriber in &subscribers {
            subscriber.deliver(&snapshot, &self.stats);
        }
    }
}
