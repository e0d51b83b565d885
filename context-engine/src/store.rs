//! Node store: an arena graph
//!
//! Nodes live in a flat `Vec<Option<NodeSlot>>` addressed through a
//! `NodeId -> slot` map; edges are stored once in an edge table and referenced
//! from per-node adjacency lists by `EdgeId`. Cycles cost nothing and deletion
//! is a registry operation: empty the slot, unlink the edges, recycle the slot.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::DedupIndex;
use crate::error::{ContextError, Result};
use crate::node::{
    validate_vector, ContentHash, Edge, EdgeId, Node, NodeId, NodeMetadata,
};

struct NodeSlot {
    id: NodeId,
    hash: ContentHash,
    content: String,
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
    // bumped under the shared lock
    last_accessed_ms: AtomicI64,
    access_count: AtomicU64,
    importance: f32,
    importance_hint: Option<f32>,
    position: Option<[f32; 3]>,
    tags: BTreeSet<String>,
    outgoing: Vec<EdgeId>,
    incoming: Vec<EdgeId>,
}

impl NodeSlot {
    fn last_accessed(&self) -> DateTime<Utc> {
        let ms = self.last_accessed_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.created_at)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            created_at: self.created_at,
            last_accessed: self.last_accessed(),
            access_count: self.access_count.load(Ordering::Acquire),
            importance: self.importance,
            importance_hint: self.importance_hint,
            position: self.position,
            tags: self.tags.clone(),
        }
    }

    fn to_node(&self) -> Node {
        Node {
            id: self.id.clone(),
            content: self.content.clone(),
            embedding: self.embedding.clone(),
            metadata: self.metadata(),
        }
    }
}

/// Outcome of an insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inserted {
    pub id: NodeId,
    /// False when the content was already stored
    pub created: bool,
}

/// What a delete took with it
#[derive(Debug, Clone)]
pub struct Removed {
    pub node: Node,
    pub edges: Vec<Edge>,
}

/// Inputs to the importance score of one node
#[derive(Debug, Clone)]
pub struct ScoringInput {
    pub id: NodeId,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub importance_hint: Option<f32>,
    /// Heaviest incident edge, in either direction
    pub max_edge_weight: Option<f32>,
}

/// Serializable image of the whole graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub next_edge: u64,
}

/// Lazy walk over one node's adjacency list
///
/// Borrows the store, yields each matching endpoint once, and cannot be
/// rewound; call `neighbors` again for a fresh walk.
pub struct Neighbors<'a> {
    edge_ids: std::slice::Iter<'a, EdgeId>,
    edges: &'a HashMap<EdgeId, Edge>,
    relation: Option<&'a str>,
    outgoing: bool,
}

impl<'a> Iterator for Neighbors<'a> {
    type Item = &'a NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        for edge_id in self.edge_ids.by_ref() {
            let Some(edge) = self.edges.get(edge_id) else {
                continue;
            };
            if self.relation.map_or(true, |r| r == edge.relation) {
                return Some(if self.outgoing { &edge.dst } else { &edge.src });
            }
        }
        None
    }
}

/// Arena-backed node and edge registry
pub struct NodeStore {
    dimension: usize,
    slots: Vec<Option<NodeSlot>>,
    free: Vec<usize>,
    by_id: HashMap<NodeId, usize>,
    edges: HashMap<EdgeId, Edge>,
    next_edge: u64,
    dedup: DedupIndex,
}

impl NodeStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            edges: HashMap::new(),
            next_edge: 0,
            dedup: DedupIndex::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn node_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Existing node for this content, if stored
    pub fn find_duplicate(&self, content: &str) -> Option<&NodeId> {
        self.dedup.lookup(&ContentHash::of(content))
    }

    /// Store a node unless identical content is already present
    pub fn insert(
        &mut self,
        content: String,
        embedding: Vec<f32>,
        metadata: NodeMetadata,
    ) -> Result<Inserted> {
        validate_vector(&embedding, self.dimension)?;

        let hash = ContentHash::of(&content);
        if let Some(existing) = self.dedup.lookup(&hash) {
            return Ok(Inserted {
                id: existing.clone(),
                created: false,
            });
        }

        let id = NodeId::from_hash(&hash);
        let slot = NodeSlot {
            id: id.clone(),
            hash,
            content,
            embedding,
            created_at: metadata.created_at,
            last_accessed_ms: AtomicI64::new(metadata.last_accessed.timestamp_millis()),
            access_count: AtomicU64::new(metadata.access_count),
            importance: metadata.importance,
            importance_hint: metadata.importance_hint,
            position: metadata.position,
            tags: metadata.tags,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id.clone(), index);
        self.dedup.record(hash, id.clone());

        Ok(Inserted { id, created: true })
    }

    fn slot(&self, id: &NodeId) -> Option<&NodeSlot> {
        self.by_id
            .get(id)
            .and_then(|&index| self.slots[index].as_ref())
    }

    fn slot_mut(&mut self, id: &NodeId) -> Option<&mut NodeSlot> {
        let index = *self.by_id.get(id)?;
        self.slots[index].as_mut()
    }

    /// Snapshot of a node without counting an access
    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.slot(id).map(NodeSlot::to_node)
    }

    /// Metadata of a node without cloning its content or embedding
    pub fn metadata(&self, id: &NodeId) -> Option<NodeMetadata> {
        self.slot(id).map(NodeSlot::metadata)
    }

    /// Record an access; safe under a shared borrow
    pub fn touch(&self, id: &NodeId, now: DateTime<Utc>) -> bool {
        match self.slot(id) {
            Some(slot) => {
                slot.access_count.fetch_add(1, Ordering::AcqRel);
                slot.last_accessed_ms
                    .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Store the latest consolidation score
    pub fn set_importance(&mut self, id: &NodeId, score: f32) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                slot.importance = score;
                true
            }
            None => false,
        }
    }

    /// Delete a node and every edge touching it
    pub fn remove(&mut self, id: &NodeId) -> Option<Removed> {
        let index = self.by_id.remove(id)?;
        let slot = self.slots[index].take()?;
        self.free.push(index);
        self.dedup.forget(&slot.hash);

        let mut removed_edges = Vec::new();
        for edge_id in slot.outgoing.iter().chain(slot.incoming.iter()) {
            // self-loops appear in both lists
            let Some(edge) = self.edges.remove(edge_id) else {
                continue;
            };
            let other = if &edge.src == id { &edge.dst } else { &edge.src };
            if let Some(neighbor) = self.slot_mut(&other.clone()) {
                neighbor.outgoing.retain(|e| e != edge_id);
                neighbor.incoming.retain(|e| e != edge_id);
            }
            removed_edges.push(edge);
        }

        Some(Removed {
            node: slot.to_node(),
            edges: removed_edges,
        })
    }

    /// Link two existing nodes
    ///
    /// Re-adding the same `(src, dst, relation)` updates the weight and keeps
    /// the original id.
    pub fn add_edge(
        &mut self,
        src: &NodeId,
        dst: &NodeId,
        relation: &str,
        weight: f32,
        now: DateTime<Utc>,
    ) -> Result<EdgeId> {
        if relation.trim().is_empty() {
            return Err(ContextError::invalid_input("relation must not be empty"));
        }
        if !weight.is_finite() {
            return Err(ContextError::invalid_input("edge weight must be finite"));
        }
        let src_slot = self
            .slot(src)
            .ok_or_else(|| ContextError::not_found(format!("node {src}")))?;
        if !self.contains(dst) {
            return Err(ContextError::not_found(format!("node {dst}")));
        }

        let existing = src_slot.outgoing.iter().copied().find(|edge_id| {
            self.edges
                .get(edge_id)
                .is_some_and(|e| &e.dst == dst && e.relation == relation)
        });
        if let Some(edge_id) = existing {
            if let Some(edge) = self.edges.get_mut(&edge_id) {
                edge.weight = weight;
            }
            return Ok(edge_id);
        }

        let edge_id = EdgeId(self.next_edge);
        self.next_edge += 1;
        self.edges.insert(
            edge_id,
            Edge {
                id: edge_id,
                src: src.clone(),
                dst: dst.clone(),
                relation: relation.to_string(),
                weight,
                created_at: now,
            },
        );
        if let Some(slot) = self.slot_mut(src) {
            slot.outgoing.push(edge_id);
        }
        if let Some(slot) = self.slot_mut(dst) {
            slot.incoming.push(edge_id);
        }
        Ok(edge_id)
    }

    pub fn get_edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Remove one edge; false if it was already gone
    pub fn remove_edge(&mut self, id: EdgeId) -> bool {
        let Some(edge) = self.edges.remove(&id) else {
            return false;
        };
        if let Some(slot) = self.slot_mut(&edge.src) {
            slot.outgoing.retain(|e| *e != id);
        }
        if let Some(slot) = self.slot_mut(&edge.dst) {
            slot.incoming.retain(|e| *e != id);
        }
        true
    }

    /// Targets of outgoing edges, optionally restricted to one relation
    pub fn neighbors<'a>(
        &'a self,
        id: &NodeId,
        relation: Option<&'a str>,
    ) -> Result<Neighbors<'a>> {
        let slot = self
            .slot(id)
            .ok_or_else(|| ContextError::not_found(format!("node {id}")))?;
        Ok(Neighbors {
            edge_ids: slot.outgoing.iter(),
            edges: &self.edges,
            relation,
            outgoing: true,
        })
    }

    /// Sources of incoming edges, optionally restricted to one relation
    pub fn incoming<'a>(
        &'a self,
        id: &NodeId,
        relation: Option<&'a str>,
    ) -> Result<Neighbors<'a>> {
        let slot = self
            .slot(id)
            .ok_or_else(|| ContextError::not_found(format!("node {id}")))?;
        Ok(Neighbors {
            edge_ids: slot.incoming.iter(),
            edges: &self.edges,
            relation,
            outgoing: false,
        })
    }

    /// Heaviest edge weight touching `id`
    pub fn max_incident_weight(&self, id: &NodeId) -> Option<f32> {
        let slot = self.slot(id)?;
        slot.outgoing
            .iter()
            .chain(slot.incoming.iter())
            .filter_map(|edge_id| self.edges.get(edge_id))
            .map(|edge| edge.weight)
            .reduce(f32::max)
    }

    /// Ids of nodes carrying `tag`
    pub fn find_by_tag(&self, tag: &str) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .slots
            .iter()
            .flatten()
            .filter(|slot| slot.tags.contains(tag))
            .map(|slot| slot.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Check a node's metadata without cloning its embedding
    pub fn matches(&self, id: &NodeId, predicate: impl Fn(&NodeMetadataView<'_>) -> bool) -> bool {
        self.slot(id).is_some_and(|slot| {
            predicate(&NodeMetadataView {
                importance: slot.importance,
                position: slot.position,
                tags: &slot.tags,
            })
        })
    }

    /// Everything consolidation needs, one entry per live node
    pub fn scoring_inputs(&self) -> Vec<ScoringInput> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| ScoringInput {
                id: slot.id.clone(),
                last_accessed: slot.last_accessed(),
                access_count: slot.access_count.load(Ordering::Acquire),
                importance_hint: slot.importance_hint,
                max_edge_weight: self.max_incident_weight(&slot.id),
            })
            .collect()
    }

    /// Full copy of nodes and edges, sorted for stable output
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut nodes: Vec<Node> = self.slots.iter().flatten().map(NodeSlot::to_node).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<Edge> = self.edges.values().cloned().collect();
        edges.sort_by_key(|e| e.id);
        StoreSnapshot {
            nodes,
            edges,
            next_edge: self.next_edge,
        }
    }

    /// Rebuild a store from a snapshot, re-checking every invariant
    pub fn from_snapshot(dimension: usize, snapshot: StoreSnapshot) -> Result<Self> {
        let mut store = Self::new(dimension);
        for node in snapshot.nodes {
            let expected = NodeId::from_content(&node.content);
            if expected != node.id {
                return Err(ContextError::serialization(format!(
                    "snapshot node {} does not match its content hash",
                    node.id
                )));
            }
            store.insert(node.content, node.embedding, node.metadata)?;
        }

        for edge in snapshot.edges {
            if !store.contains(&edge.src) || !store.contains(&edge.dst) {
                return Err(ContextError::serialization(format!(
                    "snapshot edge {} references a missing node",
                    edge.id
                )));
            }
            if let Some(slot) = store.slot_mut(&edge.src) {
                slot.outgoing.push(edge.id);
            }
            if let Some(slot) = store.slot_mut(&edge.dst) {
                slot.incoming.push(edge.id);
            }
            store.next_edge = store.next_edge.max(edge.id.0 + 1);
            store.edges.insert(edge.id, edge);
        }
        store.next_edge = store.next_edge.max(snapshot.next_edge);
        Ok(store)
    }

    /// Live node ids with their embeddings, for index rebuilds
    pub fn embeddings(&self) -> impl Iterator<Item = (&NodeId, &[f32])> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| (&slot.id, slot.embedding.as_slice()))
    }
}

/// Borrowed view of the filterable node fields
pub struct NodeMetadataView<'a> {
    pub importance: f32,
    pub position: Option<[f32; 3]>,
    pub tags: &'a BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MetadataInput;

    fn meta() -> NodeMetadata {
        MetadataInput::new().into_metadata(Utc::now())
    }

    fn store_with(contents: &[&str]) -> (NodeStore, Vec<NodeId>) {
        let mut store = NodeStore::new(2);
        let ids = contents
            .iter()
            .map(|c| store.insert(c.to_string(), vec![1.0, 0.0], meta()).unwrap().id)
            .collect();
        (store, ids)
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut store = NodeStore::new(2);
        let first = store.insert("hello".into(), vec![1.0, 0.0], meta()).unwrap();
        let second = store.insert("hello".into(), vec![0.0, 1.0], meta()).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.node_count(), 1);
        // first write wins
        assert_eq!(store.get(&first.id).unwrap().embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn test_insert_rejects_wrong_dimension() {
        let mut store = NodeStore::new(3);
        let err = store.insert("x".into(), vec![1.0], meta()).unwrap_err();
        assert!(matches!(
            err,
            ContextError::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        ));
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn test_touch_bumps_access() {
        let (store, ids) = store_with(&["a"]);
        let later = Utc::now() + chrono::Duration::hours(1);

        assert!(store.touch(&ids[0], later));
        assert!(store.touch(&ids[0], later));

        let node = store.get(&ids[0]).unwrap();
        assert_eq!(node.metadata.access_count, 2);
        assert_eq!(
            node.metadata.last_accessed.timestamp_millis(),
            later.timestamp_millis()
        );
    }

    #[test]
    fn test_edge_requires_endpoints() {
        let (mut store, ids) = store_with(&["a"]);
        let ghost = NodeId::from_content("ghost");

        let err = store
            .add_edge(&ids[0], &ghost, "rel", 1.0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ContextError::NotFound(_)));
        assert!(store
            .add_edge(&ghost, &ids[0], "rel", 1.0, Utc::now())
            .is_err());
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn test_edge_rejects_bad_input() {
        let (mut store, ids) = store_with(&["a", "b"]);
        assert!(store.add_edge(&ids[0], &ids[1], "", 1.0, Utc::now()).is_err());
        assert!(store
            .add_edge(&ids[0], &ids[1], "rel", f32::NAN, Utc::now())
            .is_err());
    }

    #[test]
    fn test_parallel_edges_by_relation() {
        let (mut store, ids) = store_with(&["a", "b"]);
        let now = Utc::now();

        let cites = store.add_edge(&ids[0], &ids[1], "cites", 0.5, now).unwrap();
        let refines = store.add_edge(&ids[0], &ids[1], "refines", 0.2, now).unwrap();
        let again = store.add_edge(&ids[0], &ids[1], "cites", 0.9, now).unwrap();

        assert_ne!(cites, refines);
        assert_eq!(cites, again);
        assert_eq!(store.edge_count(), 2);
        assert_eq!(store.get_edge(cites).unwrap().weight, 0.9);
    }

    #[test]
    fn test_neighbors_filter_and_cycles() {
        let (mut store, ids) = store_with(&["a", "b", "c"]);
        let now = Utc::now();
        store.add_edge(&ids[0], &ids[1], "next", 1.0, now).unwrap();
        store.add_edge(&ids[1], &ids[2], "next", 1.0, now).unwrap();
        store.add_edge(&ids[2], &ids[0], "next", 1.0, now).unwrap();
        store.add_edge(&ids[0], &ids[2], "see_also", 1.0, now).unwrap();

        let all: Vec<_> = store.neighbors(&ids[0], None).unwrap().cloned().collect();
        assert_eq!(all, vec![ids[1].clone(), ids[2].clone()]);

        let next: Vec<_> = store
            .neighbors(&ids[0], Some("next"))
            .unwrap()
            .cloned()
            .collect();
        assert_eq!(next, vec![ids[1].clone()]);

        let into_a: Vec<_> = store.incoming(&ids[0], None).unwrap().cloned().collect();
        assert_eq!(into_a, vec![ids[2].clone()]);
    }

    #[test]
    fn test_neighbors_is_single_pass() {
        let (mut store, ids) = store_with(&["a", "b"]);
        store.add_edge(&ids[0], &ids[1], "r", 1.0, Utc::now()).unwrap();

        let mut walk = store.neighbors(&ids[0], None).unwrap();
        assert_eq!(walk.next(), Some(&ids[1]));
        assert_eq!(walk.next(), None);
        assert_eq!(walk.next(), None);
    }

    #[test]
    fn test_remove_cascades_edges() {
        let (mut store, ids) = store_with(&["a", "b", "c"]);
        let now = Utc::now();
        store.add_edge(&ids[0], &ids[1], "r", 1.0, now).unwrap();
        store.add_edge(&ids[1], &ids[2], "r", 1.0, now).unwrap();
        store.add_edge(&ids[1], &ids[1], "self", 1.0, now).unwrap();

        let removed = store.remove(&ids[1]).unwrap();
        assert_eq!(removed.edges.len(), 3);
        assert_eq!(store.edge_count(), 0);
        assert_eq!(store.neighbors(&ids[0], None).unwrap().count(), 0);
        assert_eq!(store.incoming(&ids[2], None).unwrap().count(), 0);
        assert!(store.neighbors(&ids[1], None).is_err());

        assert!(store.remove(&ids[1]).is_none());
    }

    #[test]
    fn test_reinsert_after_delete_is_fresh() {
        let mut store = NodeStore::new(2);
        let id = store.insert("x".into(), vec![1.0, 0.0], meta()).unwrap().id;
        store.touch(&id, Utc::now());
        store.remove(&id);

        let again = store.insert("x".into(), vec![0.0, 1.0], meta()).unwrap();
        assert!(again.created);
        assert_eq!(again.id, id);
        let node = store.get(&id).unwrap();
        assert_eq!(node.metadata.access_count, 0);
        assert_eq!(node.embedding, vec![0.0, 1.0]);
    }

    #[test]
    fn test_slots_are_recycled() {
        let (mut store, ids) = store_with(&["a", "b"]);
        store.remove(&ids[0]);
        store.insert("c".into(), vec![1.0, 0.0], meta()).unwrap();
        assert_eq!(store.slots.len(), 2);
        assert_eq!(store.node_count(), 2);
    }

    #[test]
    fn test_max_incident_weight() {
        let (mut store, ids) = store_with(&["a", "b", "c"]);
        let now = Utc::now();
        store.add_edge(&ids[0], &ids[1], "r", 0.3, now).unwrap();
        store.add_edge(&ids[2], &ids[0], "r", 0.9, now).unwrap();

        assert_eq!(store.max_incident_weight(&ids[0]), Some(0.9));
        assert_eq!(store.max_incident_weight(&ids[1]), Some(0.3));

        let (lonely, lonely_ids) = store_with(&["z"]);
        assert_eq!(lonely.max_incident_weight(&lonely_ids[0]), None);
    }

    #[test]
    fn test_find_by_tag() {
        let mut store = NodeStore::new(2);
        let tagged = MetadataInput::new().tag("infra").into_metadata(Utc::now());
        let id = store.insert("a".into(), vec![1.0, 0.0], tagged).unwrap().id;
        store.insert("b".into(), vec![1.0, 0.0], meta()).unwrap();

        assert_eq!(store.find_by_tag("infra"), vec![id]);
        assert!(store.find_by_tag("none").is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_graph() {
        let (mut store, ids) = store_with(&["a", "b"]);
        let edge = store.add_edge(&ids[0], &ids[1], "r", 0.7, Utc::now()).unwrap();
        store.touch(&ids[0], Utc::now());

        let restored = NodeStore::from_snapshot(2, store.snapshot()).unwrap();
        assert_eq!(restored.node_count(), 2);
        assert_eq!(restored.get_edge(edge).unwrap().weight, 0.7);
        assert_eq!(restored.get(&ids[0]).unwrap().metadata.access_count, 1);
        assert!(restored.find_duplicate("a").is_some());

        let mut restored = restored;
        let next = restored.add_edge(&ids[1], &ids[0], "r", 0.1, Utc::now()).unwrap();
        assert!(next.0 > edge.0);
    }

    #[test]
    fn test_snapshot_rejects_tampered_node() {
        let (store, _) = store_with(&["a"]);
        let mut snapshot = store.snapshot();
        snapshot.nodes[0].content = "tampered".into();
        assert!(NodeStore::from_snapshot(2, snapshot).is_err());
    }
}
