//! The `directions` child index of a threaded node.
//!
//! ```text
//! node/K
//!   ├── head: "P"             ← back-reference to the parent
//!   └── directions
//!         ├── C1: { ...preview }   ← linked child
//!         ├── C2: null             ← unlinked (C2 itself may still exist)
//!         └── C3: true             ← linked child, bare marker
//! ```
//!
//! Unlinking (a null entry here) is weaker than deleting the child record.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One entry of a `directions` map.
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    /// Explicit null: unlinked.
    Tombstone,
    /// Denormalized preview of the child (any non-null value).
    Preview(Value),
}

impl Link {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Link::Tombstone,
            Some(v) => Link::Preview(v.clone()),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Link::Preview(_))
    }
}

/// Child key → link, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directions {
    links: BTreeMap<String, Link>,
}

/// Result of comparing a `directions` index with the set of open child feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectionsDiff {
    /// Linked but not yet open.
    pub to_open: Vec<String>,
    /// Open but no longer linked.
    pub to_close: Vec<String>,
}

impl DirectionsDiff {
    pub fn is_empty(&self) -> bool {
        self.to_open.is_empty() && self.to_close.is_empty()
    }
}

impl Directions {
    /// Parse the raw `directions` field. Store metadata keys (`_`, `#`) are skipped.
    pub fn from_value(value: Option<&Value>) -> Self {
        let mut links = BTreeMap::new();
        if let Some(Value::Object(map)) = value {
            for (child, entry) in map {
                if is_metadata_key(child) {
                    continue;
                }
                links.insert(child.clone(), Link::from_value(Some(entry)));
            }
        }
        Self { links }
    }

    /// Record one link change, as delivered by a fan-out feed.
    pub fn apply(&mut self, child: &str, value: Option<&Value>) {
        if is_metadata_key(child) {
            return;
        }
        self.links.insert(child.to_string(), Link::from_value(value));
    }

    pub fn link(&self, child: &str) -> Option<&Link> {
        self.links.get(child)
    }

    pub fn is_linked(&self, child: &str) -> bool {
        self.links.get(child).is_some_and(Link::is_live)
    }

    /// Keys of linked (non-tombstoned) children.
    pub fn live_keys(&self) -> impl Iterator<Item = &str> {
        self.links
            .iter()
            .filter(|(_, link)| link.is_live())
            .map(|(key, _)| key.as_str())
    }

    pub fn live_count(&self) -> usize {
        self.live_keys().count()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Which child feeds to open and close so `open` matches the live links.
    pub fn diff(&self, open: &BTreeSet<String>) -> DirectionsDiff {
        let to_open = self
            .live_keys()
            .filter(|key| !open.contains(*key))
            .map(str::to_string)
            .collect();
        let to_close = open
            .iter()
            .filter(|key| !self.is_linked(key))
            .cloned()
            .collect();
        DirectionsDiff { to_open, to_close }
    }
}

fn is_metadata_key(key: &str) -> bool {
    key == "_" || key == "#"
}
