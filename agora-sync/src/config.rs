//! Sync layer configuration.

use agora_core::path::validate_segment;
use agora_core::{PathError, StorePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration shared by the multiplexer, mutation pipeline and client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Namespace every collection lives under
    pub namespace: String,
    /// Coalescing window for snapshot emission, in milliseconds
    pub coalesce_window_ms: u64,
    /// Per-collection field that must hold text for a record to be emitted
    pub body_fields: BTreeMap<String, String>,
    /// Collection receiving archived copies of deleted records
    pub archive_collection: String,
    /// Collection holding threaded discussion nodes
    pub node_collection: String,
    /// Collection mapping public keys to display names
    pub username_collection: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut body_fields = BTreeMap::new();
        body_fields.insert("post".to_string(), "title".to_string());
        body_fields.insert("node".to_string(), "content".to_string());
        Self {
            namespace: "agora".to_string(),
            coalesce_window_ms: 40,
            body_fields,
            archive_collection: "archive".to_string(),
            node_collection: "node".to_string(),
            username_collection: "username_maps".to_string(),
        }
    }
}

impl SyncConfig {
    /// Short coalescing window so tests settle quickly.
    pub fn for_testing() -> Self {
        Self {
            namespace: "test".to_string(),
            coalesce_window_ms: 5,
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coalesce_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "coalesce_window_ms must be greater than zero".to_string(),
            ));
        }
        let names = [
            ("namespace", &self.namespace),
            ("archive_collection", &self.archive_collection),
            ("node_collection", &self.node_collection),
            ("username_collection", &self.username_collection),
        ];
        for (label, value) in names {
            validate_segment(value)
                .map_err(|e| ConfigError::Invalid(format!("{label}: {e}")))?;
        }
        for collection in self.body_fields.keys() {
            validate_segment(collection)
                .map_err(|e| ConfigError::Invalid(format!("body_fields: {e}")))?;
        }
        Ok(())
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    /// Field a record of `collection` must carry to be emitted.
    pub fn body_field(&self, collection: &str) -> Option<&str> {
        self.body_fields.get(collection).map(String::as_str)
    }

    // ─── Paths ──────────────────────────────────────────────────

    pub fn collection_path(&self, collection: &str) -> Result<StorePath, PathError> {
        StorePath::collection(&self.namespace, collection)
    }

    pub fn record_path(&self, collection: &str, key: &str) -> Result<StorePath, PathError> {
        StorePath::record(&self.namespace, collection, key)
    }

    pub fn archive_path(&self, key: &str) -> Result<StorePath, PathError> {
        self.record_path(&self.archive_collection, key)
    }

    pub fn directions_path(&self, node_key: &str) -> Result<StorePath, PathError> {
        StorePath::directions(&self.namespace, &self.node_collection, node_key)
    }

    pub fn direction_link_path(&self, parent: &str, child: &str) -> Result<StorePath, PathError> {
        StorePath::direction_link(&self.namespace, &self.node_collection, parent, child)
    }

    pub fn username_path(&self, pub_key: &str) -> Result<StorePath, PathError> {
        self.record_path(&self.username_collection, pub_key)
    }
}
