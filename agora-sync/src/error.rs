//! Error types for the sync layer.
//!
//! Not-found and unauthorized deletes are not errors: they are reported as
//! [`RemoveOutcome`](crate::mutation::RemoveOutcome) values.

use agora_core::PathError;
use thiserror::Error;

/// Failures surfaced by a [`RemoteStore`](crate::store::RemoteStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid store path: {0}")]
    Path(#[from] PathError),
    #[error("Write to '{path}' rejected: {reason}")]
    Rejected { path: String, reason: String },
    #[error("Store connection closed")]
    Closed,
    #[error("Store transport error: {0}")]
    Transport(String),
}

/// Failures of the mutation pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Record key is required")]
    MissingKey,
    #[error("Patch must be a JSON object")]
    InvalidPatch,
    #[error("Actor must be authenticated")]
    NotAuthenticated,
    #[error("Invalid path: {0}")]
    Path(#[from] PathError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures loading or validating a [`SyncConfig`](crate::config::SyncConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
