//! Node and edge types
//!
//! Core value types shared by the store, the index and the cache.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ContextError, Result};

/// SHA-256 of a node's content; the deduplication key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }
}

/// Unique identifier for nodes, derived from content
///
/// Identical content always maps to the same id, so ids are stable across
/// restarts and across engine instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Derive the id for a piece of content
    pub fn from_content(content: &str) -> Self {
        Self::from_hash(&ContentHash::of(content))
    }

    pub fn from_hash(hash: &ContentHash) -> Self {
        Self(hex::encode(hash.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for logs
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(ContextError::invalid_input(format!(
                "node id must be 64 lowercase hex chars: {s:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

/// Identifier for edges, allocated monotonically per store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Metadata carried by every node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    /// Last consolidation score (0.0 until the first consolidation)
    pub importance: f32,
    /// Caller-supplied importance in `[0, 1]`
    pub importance_hint: Option<f32>,
    /// Optional 3-dimensional spatial coordinate
    pub position: Option<[f32; 3]>,
    pub tags: BTreeSet<String>,
}

/// A stored unit of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: NodeMetadata,
}

impl Node {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.contains(tag)
    }
}

/// Optional fields supplied with `add_node`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataInput {
    pub importance_hint: Option<f32>,
    pub position: Option<[f32; 3]>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl MetadataInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the importance hint (clamped to `[0, 1]`)
    pub fn importance(mut self, hint: f32) -> Self {
        // NaN survives the clamp and is rejected by `validate`
        self.importance_hint = Some(hint.clamp(0.0, 1.0));
        self
    }

    /// Set the spatial coordinate
    pub fn position(mut self, position: [f32; 3]) -> Self {
        self.position = Some(position);
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add multiple tags
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Reject out-of-range or non-finite numbers before they reach the store
    ///
    /// The fields are public, so a hint set without the builder is checked
    /// here rather than clamped.
    pub fn validate(&self) -> Result<()> {
        if let Some(hint) = self.importance_hint {
            if !(0.0..=1.0).contains(&hint) {
                return Err(ContextError::invalid_input(format!(
                    "importance hint must be within [0, 1], got {hint}"
                )));
            }
        }
        if let Some(position) = self.position {
            if position.iter().any(|c| !c.is_finite()) {
                return Err(ContextError::invalid_input("position must be finite"));
            }
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(ContextError::invalid_input("tags must not be blank"));
        }
        Ok(())
    }

    /// Materialize into node metadata created at `now`
    pub fn into_metadata(self, now: DateTime<Utc>) -> NodeMetadata {
        NodeMetadata {
            created_at: now,
            last_accessed: now,
            access_count: 0,
            importance: 0.0,
            importance_hint: self.importance_hint,
            position: self.position,
            tags: self.tags,
        }
    }
}

/// A directed, typed, weighted relation between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub src: NodeId,
    pub dst: NodeId,
    pub relation: String,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn touches(&self, id: &NodeId) -> bool {
        &self.src == id || &self.dst == id
    }
}

/// A query hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredNode {
    pub id: NodeId,
    pub score: f32,
}

/// Reject vectors the metric cannot score
pub fn validate_vector(vector: &[f32], dimension: usize) -> Result<()> {
    ContextError::check_dimension(dimension, vector.len())?;
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(ContextError::invalid_input("vector components must be finite"));
    }
    Ok(())
}
