//! # agora-core: record model for the agora sync layer
//!
//! Shapes shared by every collection of the remote graph store:
//!
//! ```text
//! {namespace}
//!   ├── post/{key}        Record
//!   ├── node/{key}        Record ── head ──► parent node
//!   │     └── directions  child key → preview | null
//!   ├── archive/{key}     Record + deletedAt / deletedBy
//!   └── username_maps/{pub}
//! ```
//!
//! ## Modules
//!
//! - [`record`]: open-field records, recognized fields, ordering
//! - [`directions`]: threaded-node child index
//! - [`actor`]: identities and the removal authorization rule
//! - [`path`]: namespace-qualified store paths

pub mod actor;
pub mod directions;
pub mod path;
pub mod record;

pub use actor::{Actor, ANONYMOUS};
pub use directions::{Directions, DirectionsDiff, Link};
pub use path::{PathError, StorePath};
pub use record::{field, new_key, now_millis, Record, UserType};
