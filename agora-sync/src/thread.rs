//! One level of a threaded discussion, kept live.
//!
//! ```text
//!  map_on(ns/node/K/directions) ──► Directions ──diff──► open / close
//!                                                          │
//!        subscribe_record(node, C1) ◄──────────────────────┤
//!        subscribe_record(node, C2) ◄──────────────────────┘
//!                 │ child snapshots
//!                 ▼
//!          children by key ──sort(ThreadOrder)──► callback(&[Record])
//! ```
//!
//! Deeper levels are another `ThreadView` on a child key.

use agora_core::{Directions, Record};
use log::{debug, error, warn};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cache::{Snapshot, SnapshotCallback};
use crate::error::StoreError;
use crate::multiplexer::{Multiplexer, Subscription};
use crate::store::{Feed, StoreEvent};

/// Receives the ordered children after every change.
pub type ThreadCallback = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Comparator for custom sibling orders.
pub type RecordComparator = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// Sibling order of a thread level.
#[derive(Clone, Default)]
pub enum ThreadOrder {
    /// Most up-voted first; ties by body text, then key.
    #[default]
    ByVotes,
    /// Oldest first.
    Chronological,
    Custom(RecordComparator),
}

impl ThreadOrder {
    pub fn custom(compare: impl Fn(&Record, &Record) -> Ordering + Send + Sync + 'static) -> Self {
        ThreadOrder::Custom(Arc::new(compare))
    }

    /// `body_field` is the text used to break vote ties.
    pub fn sort(&self, records: &mut [Record], body_field: Option<&str>) {
        match self {
            ThreadOrder::ByVotes => records.sort_by(|a, b| {
                let text = |r: &Record| body_field.and_then(|f| r.str_field(f)).map(str::to_string);
                b.up_votes()
                    .cmp(&a.up_votes())
                    .then_with(|| text(a).cmp(&text(b)))
                    .then_with(|| a.key.cmp(&b.key))
            }),
            ThreadOrder::Chronological => records.sort_by(Record::oldest_first),
            ThreadOrder::Custom(compare) => records.sort_by(|a, b| compare(a, b)),
        }
    }
}

impl fmt::Debug for ThreadOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadOrder::ByVotes => f.write_str("ByVotes"),
            ThreadOrder::Chronological => f.write_str("Chronological"),
            ThreadOrder::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A live child list of one node.
///
/// Dropping the view also shuts it down; [`close`](Self::close) additionally
/// waits until every feed is released.
pub struct ThreadView {
    node_key: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ThreadView {
    /// Watch the `directions` of `node_key` and keep its children live.
    pub fn open(
        mux: &Multiplexer,
        node_key: &str,
        order: ThreadOrder,
        callback: ThreadCallback,
    ) -> Result<Self, StoreError> {
        let path = mux.config().directions_path(node_key)?;
        let feed = mux.store().map_on(&path)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (child_tx, child_rx) = mpsc::unbounded_channel();

        let body_field = mux
            .config()
            .body_field(&mux.config().node_collection)
            .map(str::to_string);
        let supervisor = ThreadSupervisor {
            mux: mux.clone(),
            node_key: node_key.to_string(),
            order,
            body_field,
            callback,
            directions: Directions::default(),
            children: BTreeMap::new(),
            records: BTreeMap::new(),
            child_tx,
            published: None,
        };
        let task = tokio::spawn(supervisor.run(feed, child_rx, shutdown_rx));
        debug!("Opened thread view on {path}");

        Ok(Self {
            node_key: node_key.to_string(),
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    /// Release the directions feed and every child subscription.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Thread view on {} ended abnormally: {e}", self.node_key);
        }
    }
}

struct ChildUpdate {
    key: String,
    record: Option<Record>,
}

struct ThreadSupervisor {
    mux: Multiplexer,
    node_key: String,
    order: ThreadOrder,
    body_field: Option<String>,
    callback: ThreadCallback,
    directions: Directions,
    /// Open child subscriptions, one per linked child
    children: BTreeMap<String, Subscription>,
    /// Latest record per child that currently has one
    records: BTreeMap<String, Record>,
    child_tx: mpsc::UnboundedSender<ChildUpdate>,
    published: Option<Vec<Record>>,
}

impl ThreadSupervisor {
    async fn run(
        mut self,
        feed: Feed,
        mut child_rx: mpsc::UnboundedReceiver<ChildUpdate>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let Feed { mut events, handle } = feed;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => {
                    let Some(StoreEvent { key, value }) = event else {
                        debug!("Directions feed for {} ended", self.node_key);
                        break;
                    };
                    self.directions.apply(&key, value.as_ref());
                    self.reconcile().await;
                    self.publish();
                }
                Some(update) = child_rx.recv() => {
                    // Updates from a child closed since they were queued are stale.
                    if !self.children.contains_key(&update.key) {
                        continue;
                    }
                    match update.record {
                        Some(record) => self.records.insert(update.key, record),
                        None => self.records.remove(&update.key),
                    };
                    self.publish();
                }
            }
        }

        handle.off();
        for (_, subscription) in std::mem::take(&mut self.children) {
            subscription.unsubscribe().await;
        }
        debug!("Closed thread view on {}", self.node_key);
    }

    /// Open feeds for newly linked children, release unlinked ones.
    async fn reconcile(&mut self) {
        let open: BTreeSet<String> = self.children.keys().cloned().collect();
        let diff = self.directions.diff(&open);

        for key in diff.to_close {
            if let Some(subscription) = self.children.remove(&key) {
                subscription.unsubscribe().await;
            }
            self.records.remove(&key);
            debug!("Unlinked {key} from {}", self.node_key);
        }

        let collection = self.mux.config().node_collection.clone();
        for key in diff.to_open {
            let tx = self.child_tx.clone();
            let child = key.clone();
            let callback: SnapshotCallback = Arc::new(move |snapshot: &Snapshot| {
                let _ = tx.send(ChildUpdate {
                    key: child.clone(),
                    record: snapshot.get(&child).cloned(),
                });
            });
            match self.mux.subscribe_record(&collection, &key, callback).await {
                Ok(subscription) => {
                    self.children.insert(key, subscription);
                }
                Err(e) => warn!("Cannot follow child {key} of {}: {e}", self.node_key),
            }
        }
    }

    fn publish(&mut self) {
        let mut list: Vec<Record> = self
            .records
            .iter()
            .filter(|(key, _)| self.directions.is_linked(key))
            .map(|(_, record)| record.clone())
            .collect();
        self.order.sort(&mut list, self.body_field.as_deref());

        if self.published.as_ref() == Some(&list) {
            return;
        }
        let callback = &self.callback;
        if catch_unwind(AssertUnwindSafe(|| callback(&list))).is_err() {
            error!("Thread callback for {} panicked", self.node_key);
        }
        self.published = Some(list);
    }
}
