//! Who is acting, and the public-key → display-name directory.

use agora_core::{now_millis, Actor};
use log::{debug, info};
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::SyncConfig;
use crate::error::MutationError;
use crate::store::RemoteStore;

/// Source of the current actor. Read once per mutation, never cached.
pub trait ActorResolver: Send + Sync {
    fn current(&self) -> Actor;
}

impl ActorResolver for Actor {
    fn current(&self) -> Actor {
        self.clone()
    }
}

/// Session actor that can change while the client is running.
#[derive(Clone, Default)]
pub struct SharedActor {
    inner: Arc<RwLock<Actor>>,
}

impl SharedActor {
    pub fn new(actor: Actor) -> Self {
        Self {
            inner: Arc::new(RwLock::new(actor)),
        }
    }

    pub fn set(&self, actor: Actor) {
        info!("Actor changed to {}", actor.display_identity());
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = actor;
    }

    /// Back to an unauthenticated session, keeping any guest name.
    pub fn sign_out(&self) {
        let mut actor = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        actor.is_authenticated = false;
        actor.pub_key = None;
        debug!("Signed out");
    }
}

impl ActorResolver for SharedActor {
    fn current(&self) -> Actor {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Display names published under `username_maps/{pub}`.
pub struct UsernameDirectory {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
}

impl UsernameDirectory {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Map the actor's public key to `alias`.
    pub async fn publish(&self, actor: &Actor, alias: &str) -> Result<(), MutationError> {
        let pub_key = match (actor.is_authenticated, actor.pub_key()) {
            (true, Some(key)) => key,
            _ => return Err(MutationError::NotAuthenticated),
        };
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(MutationError::InvalidPatch);
        }
        let path = self.config.username_path(pub_key)?;
        let entry = json!({
            "alias": alias,
            "pub": pub_key,
            "timestamp": now_millis(),
        });
        self.store.put(&path, Some(entry)).await?;
        info!("Published username {alias} for {pub_key}");
        Ok(())
    }

    /// Alias registered for `pub_key`, if any.
    pub async fn lookup(&self, pub_key: &str) -> Result<Option<String>, MutationError> {
        let path = self.config.username_path(pub_key)?;
        let alias = self
            .store
            .once(&path)
            .await?
            .as_ref()
            .and_then(|v| v.get("alias"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(alias)
    }
}
