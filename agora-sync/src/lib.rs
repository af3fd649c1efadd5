//! # agora-sync: live collections and authorized writes over a graph store
//!
//! Keeps local, ordered views of remote collections fresh while the remote
//! store pushes changes, and writes on behalf of the current actor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  subscribe / upsert / remove   ┌──────────────┐
//! │  SyncClient  │ ◄───────────────────────────── │ application  │
//! └──────┬───────┘                                └──────────────┘
//!        │
//!        ├──────────────► Multiplexer ──► CollectionCache (one per feed)
//!        │                     ▲                 │  coalesced Snapshots
//!        │                     │                 ▼
//!        ├──► ThreadView ──────┘            subscribers
//!        │    (directions → child feeds)
//!        │
//!        ├──► Mutator ──────────┐
//!        └──► UsernameDirectory ┤
//!                               ▼
//!                        ┌─────────────┐
//!                        │ RemoteStore │  put / once / on / map_on
//!                        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: the remote store seam and an in-memory implementation
//! - [`cache`]: per-feed canonical map, dedup, coalesced emission
//! - [`multiplexer`]: one feed per target, refcounted by subscribers
//! - [`thread`]: one live level of a threaded discussion
//! - [`mutation`]: enrichment, authorization, archive-then-tombstone
//! - [`identity`]: current actor and username directory
//! - [`client`]: the facade tying these together
//! - [`config`]: [`SyncConfig`]
//! - [`error`]: error types per layer

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod multiplexer;
pub mod mutation;
pub mod store;
pub mod thread;

// Re-exports for convenience
pub use agora_core::{Actor, Record, StorePath};
pub use cache::{materialize, CacheStats, FeedTarget, Snapshot, SnapshotCallback};
pub use client::SyncClient;
pub use config::SyncConfig;
pub use error::{ConfigError, MutationError, StoreError};
pub use identity::{ActorResolver, SharedActor, UsernameDirectory};
pub use multiplexer::{Multiplexer, Subscription};
pub use mutation::{DeletePhase, Mutator, RemoveOptions, RemoveOutcome};
pub use store::{Feed, FeedHandle, MemoryStore, RemoteStore, StoreEvent, WriteRecord};
pub use thread::{ThreadCallback, ThreadOrder, ThreadView};
