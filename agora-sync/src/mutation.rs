//! Authorized writes: upsert with actor enrichment, archive-then-tombstone
//! removal, linking a reply into a thread and the two flavours of removing it.
//!
//! ```text
//!  Idle ─► Reading ─┬─► NotFound
//!                   ├─► Unauthorized
//!                   └─► Authorized ─► [Archiving] ─► Tombstoning ─► Done
//! ```
//!
//! The archive write is awaited before any destructive write (unlinks or the
//! tombstone) is issued. If archiving fails the record and its links are left
//! in place.

use agora_core::{field, now_millis, Actor, Record, StorePath};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::MutationError;
use crate::store::RemoteStore;

/// Options for [`Mutator::remove`] and [`Mutator::delete_child_fully`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Copy the record to the archive collection before tombstoning it.
    pub archive: bool,
    /// Hide the record from local snapshots before the store confirms.
    /// Applied by [`SyncClient`](crate::client::SyncClient).
    pub optimistic: bool,
}

impl RemoveOptions {
    pub fn archived() -> Self {
        Self {
            archive: true,
            optimistic: false,
        }
    }

    pub fn optimistic(mut self) -> Self {
        self.optimistic = true;
        self
    }
}

/// Result of an authorized removal. Not-found and unauthorized are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Deleted,
    NotFound,
    Unauthorized,
}

impl RemoveOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, RemoveOutcome::Deleted)
    }
}

/// States of a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePhase {
    Idle,
    Reading,
    NotFound,
    Unauthorized,
    Authorized,
    Archiving,
    Tombstoning,
    Done,
}

impl DeletePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeletePhase::NotFound | DeletePhase::Unauthorized | DeletePhase::Done
        )
    }
}

impl fmt::Display for DeletePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeletePhase::Idle => "idle",
            DeletePhase::Reading => "reading",
            DeletePhase::NotFound => "not-found",
            DeletePhase::Unauthorized => "unauthorized",
            DeletePhase::Authorized => "authorized",
            DeletePhase::Archiving => "archiving",
            DeletePhase::Tombstoning => "tombstoning",
            DeletePhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Logs every phase change of one removal.
struct DeleteTrace {
    target: String,
    phase: DeletePhase,
}

impl DeleteTrace {
    fn new(collection: &str, key: &str) -> Self {
        Self {
            target: format!("{collection}/{key}"),
            phase: DeletePhase::Idle,
        }
    }

    fn advance(&mut self, next: DeletePhase) {
        debug!("Delete {}: {} -> {}", self.target, self.phase, next);
        self.phase = next;
    }
}

/// Issues writes on behalf of an actor.
pub struct Mutator {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
}

impl Mutator {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Merge `patch` into `collection/key`, stamped with the actor's identity.
    ///
    /// `null` and empty-string fields are dropped from the patch. Identity
    /// fields and `timestamp` always come from the actor and the clock.
    pub async fn upsert(
        &self,
        collection: &str,
        key: &str,
        patch: Value,
        actor: &Actor,
    ) -> Result<Record, MutationError> {
        if key.is_empty() {
            return Err(MutationError::MissingKey);
        }
        let path = self.config.record_path(collection, key)?;
        let Value::Object(fields) = patch else {
            return Err(MutationError::InvalidPatch);
        };

        let mut record = Record::from_fields(key, strip_empty(fields));
        enrich(&mut record, actor);
        self.store.put(&path, Some(record.to_value())).await?;
        debug!("Upserted {path} as {}", actor.display_identity());
        Ok(record)
    }

    /// Remove `collection/key` if `actor` owns it.
    pub async fn remove(
        &self,
        collection: &str,
        key: &str,
        actor: &Actor,
        options: RemoveOptions,
    ) -> Result<RemoveOutcome, MutationError> {
        if key.is_empty() {
            return Err(MutationError::MissingKey);
        }
        let path = self.config.record_path(collection, key)?;
        let mut trace = DeleteTrace::new(collection, key);

        trace.advance(DeletePhase::Reading);
        let Some(record) = self.read_record(&path, key).await? else {
            trace.advance(DeletePhase::NotFound);
            return Ok(RemoveOutcome::NotFound);
        };
        if !actor.owns(&record) {
            trace.advance(DeletePhase::Unauthorized);
            info!("{} may not delete {path}", actor.display_identity());
            return Ok(RemoveOutcome::Unauthorized);
        }
        trace.advance(DeletePhase::Authorized);

        if options.archive {
            self.archive(collection, &path, record, actor, &mut trace).await?;
        }
        self.tombstone(&path, &mut trace).await?;
        Ok(RemoveOutcome::Deleted)
    }

    /// Add `child` to `parent`'s `directions` with a preview value.
    ///
    /// Only the link is written: the parent record and its identity fields
    /// are untouched, so any actor may reply to any node.
    pub async fn link_child(
        &self,
        parent: &str,
        child: &str,
        preview: Value,
        actor: &Actor,
    ) -> Result<(), MutationError> {
        if parent.is_empty() || child.is_empty() {
            return Err(MutationError::MissingKey);
        }
        if preview.is_null() {
            return Err(MutationError::InvalidPatch);
        }
        let link = self.config.direction_link_path(parent, child)?;
        self.store.put(&link, Some(preview)).await?;
        debug!("Linked {link} as {}", actor.display_identity());
        Ok(())
    }

    /// Drop `child` from `parent`'s `directions`. The child record survives.
    ///
    /// Allowed for the owner of either node.
    pub async fn unlink_child(
        &self,
        parent: &str,
        child: &str,
        actor: &Actor,
    ) -> Result<RemoveOutcome, MutationError> {
        if parent.is_empty() || child.is_empty() {
            return Err(MutationError::MissingKey);
        }
        let nodes = &self.config.node_collection;
        let parent_record = self
            .read_record(&self.config.record_path(nodes, parent)?, parent)
            .await?;
        let child_record = self
            .read_record(&self.config.record_path(nodes, child)?, child)
            .await?;
        if parent_record.is_none() && child_record.is_none() {
            return Ok(RemoveOutcome::NotFound);
        }

        let owns = |record: &Option<Record>| record.as_ref().is_some_and(|r| actor.owns(r));
        if !owns(&parent_record) && !owns(&child_record) {
            info!("{} may not unlink {child} from {parent}", actor.display_identity());
            return Ok(RemoveOutcome::Unauthorized);
        }

        self.unlink(parent, child).await?;
        Ok(RemoveOutcome::Deleted)
    }

    /// Unlink `child` from `parent` and from its own `head`, then tombstone it.
    ///
    /// Requires ownership of the child.
    pub async fn delete_child_fully(
        &self,
        parent: &str,
        child: &str,
        actor: &Actor,
        options: RemoveOptions,
    ) -> Result<RemoveOutcome, MutationError> {
        if parent.is_empty() || child.is_empty() {
            return Err(MutationError::MissingKey);
        }
        let nodes = self.config.node_collection.clone();
        let path = self.config.record_path(&nodes, child)?;
        let mut trace = DeleteTrace::new(&nodes, child);

        trace.advance(DeletePhase::Reading);
        let Some(record) = self.read_record(&path, child).await? else {
            trace.advance(DeletePhase::NotFound);
            return Ok(RemoveOutcome::NotFound);
        };
        if !actor.owns(&record) {
            trace.advance(DeletePhase::Unauthorized);
            info!("{} may not delete {path}", actor.display_identity());
            return Ok(RemoveOutcome::Unauthorized);
        }
        trace.advance(DeletePhase::Authorized);

        let head = record.head().filter(|h| *h != parent).map(str::to_string);
        if options.archive {
            self.archive(&nodes, &path, record, actor, &mut trace).await?;
        }

        self.unlink(parent, child).await?;
        if let Some(head) = head {
            self.unlink(&head, child).await?;
        }
        self.tombstone(&path, &mut trace).await?;
        Ok(RemoveOutcome::Deleted)
    }

    async fn read_record(&self, path: &StorePath, key: &str) -> Result<Option<Record>, MutationError> {
        let value = self.store.once(path).await?;
        Ok(value.and_then(|v| Record::from_value(key, v)))
    }

    async fn unlink(&self, parent: &str, child: &str) -> Result<(), MutationError> {
        let link = self.config.direction_link_path(parent, child)?;
        self.store.put(&link, None).await?;
        debug!("Unlinked {link}");
        Ok(())
    }

    /// Copy `record` into the archive collection. Nothing destructive may
    /// be written for `path` unless this succeeded.
    ///
    /// Archive copies live at `archive/{key}`. Deleting a reused key again
    /// merges the new copy over the earlier one.
    async fn archive(
        &self,
        collection: &str,
        path: &StorePath,
        record: Record,
        actor: &Actor,
        trace: &mut DeleteTrace,
    ) -> Result<(), MutationError> {
        trace.advance(DeletePhase::Archiving);
        let archive_path = self.config.archive_path(&record.key)?;
        let archived = record
            .with(field::DELETED_AT, now_millis())
            .with(field::DELETED_BY, actor.display_identity())
            .with(field::DELETED_FROM, collection);
        if let Err(e) = self.store.put(&archive_path, Some(archived.to_value())).await {
            warn!("Archiving {path} failed, record left in place: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    async fn tombstone(&self, path: &StorePath, trace: &mut DeleteTrace) -> Result<(), MutationError> {
        trace.advance(DeletePhase::Tombstoning);
        self.store.put(path, None).await?;
        trace.advance(DeletePhase::Done);
        info!("Deleted {path}");
        Ok(())
    }
}

/// Drop `null` and empty-string fields.
fn strip_empty(fields: Map<String, Value>) -> Map<String, Value> {
    fields
        .into_iter()
        .filter(|(_, value)| match value {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
        .collect()
}

fn enrich(record: &mut Record, actor: &Actor) {
    record.set(field::USER, actor.display_identity());
    record.set(field::USER_TYPE, actor.user_type().as_str());
    if actor.is_authenticated {
        if let Some(pub_key) = actor.pub_key() {
            record.set(field::USER_PUB, pub_key);
            record.set(field::USER_ID, pub_key);
        }
    }
    record.set(field::TIMESTAMP, now_millis());
}
