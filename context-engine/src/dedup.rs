//! Content-hash deduplication
//!
//! Maps the SHA-256 of node content to the live node holding it. The store
//! updates this map in the same critical section as the arena, so a lookup
//! never sees a half-inserted node.

use std::collections::HashMap;

use crate::node::{ContentHash, NodeId};

#[derive(Debug, Default)]
pub struct DedupIndex {
    by_hash: HashMap<ContentHash, NodeId>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live node holding this content, if any
    pub fn lookup(&self, hash: &ContentHash) -> Option<&NodeId> {
        self.by_hash.get(hash)
    }

    pub fn record(&mut self, hash: ContentHash, id: NodeId) {
        self.by_hash.insert(hash, id);
    }

    /// Forget a deleted node so identical content creates a fresh one
    pub fn forget(&mut self, hash: &ContentHash) -> Option<NodeId> {
        self.by_hash.remove(hash)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}
