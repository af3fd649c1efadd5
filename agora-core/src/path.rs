//! Namespace-qualified paths into the remote graph store.
//!
//! Layout:
//! ```text
//! {namespace}/post/{key}
//! {namespace}/node/{key}
//! {namespace}/node/{key}/directions/{child}
//! {namespace}/archive/{key}
//! {namespace}/username_maps/{pub}
//! ```
//!
//! Segments are opaque strings; the only reserved character is `/`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Name of the child index kept on every threaded node.
pub const DIRECTIONS: &str = "directions";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path segment")]
    EmptySegment,
    #[error("path segment '{0}' contains '/'")]
    ReservedCharacter(String),
}

/// Check that `segment` can be used as one component of a [`StorePath`].
pub fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if segment.contains(SEPARATOR) {
        return Err(PathError::ReservedCharacter(segment.to_string()));
    }
    Ok(())
}

/// A `/`-joined, non-empty sequence of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorePath(String);

impl StorePath {
    /// Start a path at the given namespace.
    pub fn root(namespace: &str) -> Result<Self, PathError> {
        validate_segment(namespace)?;
        Ok(Self(namespace.to_string()))
    }

    /// Parse a full `a/b/c` path.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        for segment in raw.split(SEPARATOR) {
            validate_segment(segment)?;
        }
        Ok(Self(raw.to_string()))
    }

    /// Append one segment.
    pub fn child(&self, segment: &str) -> Result<Self, PathError> {
        validate_segment(segment)?;
        Ok(Self(format!("{}{SEPARATOR}{segment}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Last segment (the key under the parent).
    pub fn last(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or(&self.0)
    }

    /// Parent path, `None` at the namespace root.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rfind(SEPARATOR)
            .map(|idx| Self(self.0[..idx].to_string()))
    }

    /// Whether `self` equals `other` or lies underneath it.
    pub fn starts_with(&self, other: &StorePath) -> bool {
        self.0 == other.0
            || (self.0.starts_with(&other.0)
                && self.0[other.0.len()..].starts_with(SEPARATOR))
    }

    /// The segment of `self` immediately below `ancestor`, if `self` is a strict descendant.
    pub fn child_segment_under(&self, ancestor: &StorePath) -> Option<&str> {
        if self.0.len() <= ancestor.0.len() || !self.starts_with(ancestor) {
            return None;
        }
        self.0[ancestor.0.len() + 1..].split(SEPARATOR).next()
    }

    // ─── Layout helpers ─────────────────────────────────────────

    /// `{namespace}/{collection}`
    pub fn collection(namespace: &str, collection: &str) -> Result<Self, PathError> {
        Self::root(namespace)?.child(collection)
    }

    /// `{namespace}/{collection}/{key}`
    pub fn record(namespace: &str, collection: &str, key: &str) -> Result<Self, PathError> {
        Self::collection(namespace, collection)?.child(key)
    }

    /// `{namespace}/{nodes}/{key}/directions`
    pub fn directions(namespace: &str, nodes: &str, key: &str) -> Result<Self, PathError> {
        Self::record(namespace, nodes, key)?.child(DIRECTIONS)
    }

    /// `{namespace}/{nodes}/{parent}/directions/{child}`
    pub fn direction_link(
        namespace: &str,
        nodes: &str,
        parent: &str,
        child: &str,
    ) -> Result<Self, PathError> {
        Self::directions(namespace, nodes, parent)?.child(child)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
