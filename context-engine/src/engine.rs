//! The engine handle
//!
//! [`ContextEngine`] owns the graph (node store, dedup map and vector index
//! behind one `RwLock`), the tiered cache, the injected embedder and clock.
//! Writers take the lock exclusively, so the index never names a node the
//! store does not hold; readers share it and bump access counters through
//! atomics.
//!
//! Cache keys:
//! - `node:<id>` holds a serialized [`Node`]. Content and embedding are
//!   immutable for a given id and creation time, so a hit only needs live
//!   metadata laid over it.
//! - `q:<generation>:<fingerprint>` holds a result list. The generation
//!   counter moves on every change that could alter a result, so older
//!   entries simply stop being addressed.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::{CacheStats, TieredCache};
use crate::config::EngineConfig;
use crate::consolidation::{ConsolidationReport, Consolidator};
use crate::embedding::Embedder;
use crate::error::{ContextError, Result};
use crate::index::{IndexMode, Metric, VectorIndex};
use crate::node::{validate_vector, Edge, EdgeId, MetadataInput, Node, NodeId, ScoredNode};
use crate::snapshot;
use crate::store::{NodeMetadataView, NodeStore, Removed, StoreSnapshot};
use crate::temporal::{Clock, SystemClock};

const NODE_PREFIX: &str = "node:";
const QUERY_PREFIX: &str = "q:";

fn node_key(id: &NodeId) -> String {
    format!("{NODE_PREFIX}{id}")
}

type Predicate = dyn Fn(&NodeId, &NodeMetadataView) -> bool + Send + Sync;

/// Restricts which nodes a query may return
///
/// Tag and importance constraints are part of the cache key. A custom
/// predicate is opaque, so queries carrying one always go to the index.
#[derive(Clone, Default)]
pub struct QueryFilter {
    tags: BTreeSet<String>,
    min_importance: Option<f32>,
    predicate: Option<Arc<Predicate>>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a tag (all required tags must be present)
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Require the last consolidation score to be at least `min`
    pub fn min_importance(mut self, min: f32) -> Self {
        self.min_importance = Some(min);
        self
    }

    /// Arbitrary check over a node's id and metadata
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&NodeId, &NodeMetadataView) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.predicate.is_none()
    }

    fn validate(&self) -> Result<()> {
        if self.min_importance.is_some_and(|m| !m.is_finite()) {
            return Err(ContextError::invalid_input("min_importance must be finite"));
        }
        Ok(())
    }

    fn accepts(&self, id: &NodeId, view: &NodeMetadataView) -> bool {
        self.tags.iter().all(|tag| view.tags.contains(tag))
            && self.min_importance.map_or(true, |min| view.importance >= min)
            && self.predicate.as_ref().map_or(true, |p| p(id, view))
    }
}

impl fmt::Debug for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilter")
            .field("tags", &self.tags)
            .field("min_importance", &self.min_importance)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

fn query_key(generation: u64, vector: &[f32], k: usize, filter: Option<&QueryFilter>) -> String {
    let mut hasher = Sha256::new();
    for x in vector {
        hasher.update(x.to_le_bytes());
    }
    hasher.update((k as u64).to_le_bytes());
    if let Some(filter) = filter {
        for tag in &filter.tags {
            hasher.update((tag.len() as u64).to_le_bytes());
            hasher.update(tag.as_bytes());
        }
        if let Some(min) = filter.min_importance {
            hasher.update(min.to_le_bytes());
        }
    }
    format!("{QUERY_PREFIX}{generation}:{}", hex::encode(hasher.finalize()))
}

/// Engine-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub cache_hit_rate: f64,
    pub index_size: usize,
    pub index_mode: IndexMode,
    pub dimension: usize,
    pub writes_since_consolidation: u64,
    pub cache: CacheStats,
}

struct Graph {
    store: NodeStore,
    index: VectorIndex,
}

/// Shared semantic memory: nodes, edges, vector search, cache, consolidation
pub struct ContextEngine {
    config: EngineConfig,
    graph: RwLock<Graph>,
    cache: TieredCache,
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    consolidator: Consolidator,
    generation: AtomicU64,
    writes: AtomicU64,
}

impl ContextEngine {
    /// Open an empty engine
    ///
    /// The embedder must produce vectors of `config.dimension`. If the cache
    /// has a disk tier, result lists persisted by a previous run are dropped.
    pub fn open(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        ContextError::check_dimension(config.dimension, embedder.dimension())?;

        let cache = TieredCache::open(&config.cache, Arc::clone(&clock))?;
        let stale = cache.invalidate_prefix(QUERY_PREFIX);
        if stale > 0 {
            log::debug!("Dropped {} cached results from a previous run", stale);
        }

        let graph = Graph {
            store: NodeStore::new(config.dimension),
            index: VectorIndex::new(config.dimension, config.metric, config.index.clone()),
        };

        log::info!(
            "Opened context engine (dimension={}, metric={:?}, cache capacity={}, disk tier={})",
            config.dimension,
            config.metric,
            config.cache.capacity,
            cache.has_disk_tier()
        );

        Ok(Self {
            consolidator: Consolidator::new(config.consolidation.clone()),
            config,
            graph: RwLock::new(graph),
            cache,
            embedder,
            clock,
            generation: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Open with the wall clock
    pub fn new(config: EngineConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::open(config, embedder, Arc::new(SystemClock))
    }

    /// Open and load the graph saved at `path`, if there is one
    pub fn restore(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let engine = Self::open(config, embedder, clock)?;
        if let Some(snapshot) = snapshot::load_store(path.as_ref())? {
            engine.replace_graph(snapshot)?;
        }
        Ok(engine)
    }

    fn replace_graph(&self, snapshot: StoreSnapshot) -> Result<()> {
        let store = NodeStore::from_snapshot(self.config.dimension, snapshot)?;
        let mut index = VectorIndex::new(
            self.config.dimension,
            self.config.metric,
            self.config.index.clone(),
        );
        index.extend(
            store
                .embeddings()
                .map(|(id, vector)| (id.clone(), vector.to_vec())),
        )?;

        *self.graph.write() = Graph { store, index };
        self.bump_generation();
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    /// Run the injected embedder and check its output
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .embedder
            .embed(text)
            .map_err(ContextError::InjectedFunction)?;
        validate_vector(&vector, self.config.dimension)?;
        Ok(vector)
    }

    /// Store a node, or return the id of the node already holding `content`
    ///
    /// With `embedding: None` the injected embedder is called, but only when
    /// the content is not already stored.
    pub fn add_node(
        &self,
        content: impl Into<String>,
        embedding: Option<Vec<f32>>,
        metadata: MetadataInput,
    ) -> Result<NodeId> {
        let content = content.into();
        if content.is_empty() {
            return Err(ContextError::invalid_input("node content must not be empty"));
        }
        metadata.validate()?;

        let embedding = match embedding {
            Some(vector) => {
                validate_vector(&vector, self.config.dimension)?;
                vector
            }
            None => {
                if let Some(existing) = self.graph.read().store.find_duplicate(&content) {
                    return Ok(existing.clone());
                }
                self.embed(&content)?
            }
        };

        let now = self.clock.now();
        let mut graph = self.graph.write();
        let inserted = graph
            .store
            .insert(content, embedding.clone(), metadata.into_metadata(now))?;
        if !inserted.created {
            log::debug!("Content already stored as {}", inserted.id.short());
            return Ok(inserted.id);
        }

        if let Err(e) = graph.index.insert(inserted.id.clone(), embedding) {
            graph.store.remove(&inserted.id);
            return Err(e);
        }
        self.bump_generation();
        self.record_write();

        if let Some(node) = graph.store.get(&inserted.id) {
            self.warm_node(&node);
        }
        log::debug!("Added node {}", inserted.id.short());
        Ok(inserted.id)
    }

    fn warm_node(&self, node: &Node) {
        let bytes = match bincode::serialize(node) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode node {} for cache: {}", node.id.short(), e);
                return;
            }
        };
        match self
            .cache
            .put(node_key(&node.id), bytes, self.config.cache.default_ttl())
        {
            Ok(()) | Err(ContextError::CapacityExceeded) => {}
            Err(e) => log::warn!("Failed to cache node {}: {}", node.id.short(), e),
        }
    }

    fn cached_node(&self, id: &NodeId) -> Option<Node> {
        let bytes = self.cache.get(&node_key(id))?;
        match bincode::deserialize::<Node>(&bytes) {
            Ok(node) if &node.id == id => Some(node),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Discarding undecodable cache entry for {}: {}", id.short(), e);
                None
            }
        }
    }

    /// Fetch a node, counting the access
    pub fn get_node(&self, id: &NodeId) -> Result<Node> {
        let now = self.clock.now();
        let graph = self.graph.read();
        if !graph.store.touch(id, now) {
            return Err(ContextError::not_found(format!("node {id}")));
        }
        let metadata = graph
            .store
            .metadata(id)
            .ok_or_else(|| ContextError::not_found(format!("node {id}")))?;

        if let Some(mut node) = self.cached_node(id) {
            // a node re-created after a delete has a different creation time
            if node.metadata.created_at == metadata.created_at {
                node.metadata = metadata;
                return Ok(node);
            }
            self.cache.invalidate(&node_key(id));
        }

        let node = graph
            .store
            .get(id)
            .ok_or_else(|| ContextError::not_found(format!("node {id}")))?;
        self.warm_node(&node);
        Ok(node)
    }

    /// Delete a node with its edges, index entry and cache entries
    ///
    /// Returns false if the node was already gone.
    pub fn delete_node(&self, id: &NodeId) -> bool {
        let mut graph = self.graph.write();
        self.remove_locked(&mut graph, id).is_some()
    }

    fn remove_locked(&self, graph: &mut Graph, id: &NodeId) -> Option<Removed> {
        let removed = graph.store.remove(id)?;
        graph.index.remove(id);
        self.cache.invalidate(&node_key(id));
        self.bump_generation();
        self.record_write();
        log::debug!(
            "Deleted node {} and {} edges",
            id.short(),
            removed.edges.len()
        );
        Some(removed)
    }

    /// Link two existing nodes
    pub fn add_edge(
        &self,
        src: &NodeId,
        dst: &NodeId,
        relation: &str,
        weight: f32,
    ) -> Result<EdgeId> {
        let now = self.clock.now();
        let edge = self
            .graph
            .write()
            .store
            .add_edge(src, dst, relation, weight, now)?;
        self.record_write();
        Ok(edge)
    }

    pub fn get_edge(&self, id: EdgeId) -> Result<Edge> {
        self.graph
            .read()
            .store
            .get_edge(id)
            .cloned()
            .ok_or_else(|| ContextError::not_found(format!("edge {id}")))
    }

    /// Remove one edge; false if it was already gone
    pub fn remove_edge(&self, id: EdgeId) -> bool {
        let removed = self.graph.write().store.remove_edge(id);
        if removed {
            self.record_write();
        }
        removed
    }

    /// Targets of `id`'s outgoing edges
    ///
    /// The ids are collected under the read lock, so the returned iterator
    /// holds no lock while the caller consumes it.
    pub fn neighbors(
        &self,
        id: &NodeId,
        relation: Option<&str>,
    ) -> Result<std::vec::IntoIter<NodeId>> {
        let graph = self.graph.read();
        let ids: Vec<NodeId> = graph.store.neighbors(id, relation)?.cloned().collect();
        Ok(ids.into_iter())
    }

    /// Sources of `id`'s incoming edges
    pub fn incoming(
        &self,
        id: &NodeId,
        relation: Option<&str>,
    ) -> Result<std::vec::IntoIter<NodeId>> {
        let graph = self.graph.read();
        let ids: Vec<NodeId> = graph.store.incoming(id, relation)?.cloned().collect();
        Ok(ids.into_iter())
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.graph.read().store.find_by_tag(tag)
    }

    /// Top-`k` nodes by similarity to `vector`
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredNode>> {
        validate_vector(vector, self.config.dimension)?;
        if let Some(filter) = filter {
            filter.validate()?;
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let graph = self.graph.read();
        let key = filter.map_or(true, QueryFilter::is_cacheable).then(|| {
            query_key(self.generation.load(Ordering::Acquire), vector, k, filter)
        });
        if let Some(key) = &key {
            if let Some(hits) = self.cached_query(key) {
                return Ok(hits);
            }
        }

        let store = &graph.store;
        let hits = match filter {
            Some(filter) => {
                let keep: &dyn Fn(&NodeId) -> bool =
                    &|id: &NodeId| store.matches(id, |view| filter.accepts(id, view));
                graph.index.query(vector, k, Some(keep))?
            }
            None => graph.index.query(vector, k, None)?,
        };

        if let Some(key) = key {
            self.cache_query(key, &hits);
        }
        Ok(hits)
    }

    /// Embed `text` with the injected embedder, then [`query`](Self::query)
    pub fn query_text(
        &self,
        text: &str,
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredNode>> {
        let vector = self.embed(text)?;
        self.query(&vector, k, filter)
    }

    fn cached_query(&self, key: &str) -> Option<Vec<ScoredNode>> {
        let bytes = self.cache.get(key)?;
        bincode::deserialize(&bytes)
            .map_err(|e| log::warn!("Discarding undecodable cached result {}: {}", key, e))
            .ok()
    }

    fn cache_query(&self, key: String, hits: &[ScoredNode]) {
        let bytes = match bincode::serialize(hits) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode query result for cache: {}", e);
                return;
            }
        };
        match self.cache.put(key, bytes, self.config.cache.default_ttl()) {
            Ok(()) | Err(ContextError::CapacityExceeded) => {}
            Err(e) => log::warn!("Failed to cache query result: {}", e),
        }
    }

    /// Score every node and prune the ones that faded
    pub fn consolidate(&self) -> ConsolidationReport {
        let now = self.clock.now();
        let mut graph = self.graph.write();

        let inputs = graph.store.scoring_inputs();
        let plan = self.consolidator.plan(&inputs, now);
        for (id, score) in &plan.scores {
            graph.store.set_importance(id, *score);
        }

        let mut pruned_ids = Vec::with_capacity(plan.prune.len());
        for id in plan.prune {
            if self.remove_locked(&mut graph, &id).is_some() {
                pruned_ids.push(id);
            }
        }
        // importance changed, so filtered results may differ
        self.bump_generation();
        self.writes.store(0, Ordering::Release);
        drop(graph);

        self.cache.sweep_expired();

        log::info!(
            "Consolidated {} nodes: pruned {}, protected {}",
            inputs.len(),
            pruned_ids.len(),
            plan.protected.len()
        );
        ConsolidationReport {
            pruned_count: pruned_ids.len(),
            pruned_ids,
            scored: inputs.len(),
            protected: plan.protected,
        }
    }

    /// Consolidate if enough writes happened since the last pass
    pub fn tick(&self) -> Option<ConsolidationReport> {
        let every = self.config.consolidation.every_n_writes;
        if every == 0 || self.writes.load(Ordering::Acquire) < every {
            return None;
        }
        Some(self.consolidate())
    }

    pub fn stats(&self) -> EngineStats {
        let (node_count, edge_count, index_size, index_mode) = {
            let graph = self.graph.read();
            (
                graph.store.node_count(),
                graph.store.edge_count(),
                graph.index.len(),
                graph.index.mode(),
            )
        };
        let cache = self.cache.stats();
        EngineStats {
            node_count,
            edge_count,
            cache_hit_rate: cache.hit_rate(),
            index_size,
            index_mode,
            dimension: self.config.dimension,
            writes_since_consolidation: self.writes.load(Ordering::Acquire),
            cache,
        }
    }

    /// Write the graph to `path` atomically
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.graph.read().store.snapshot();
        snapshot::save_store(path.as_ref(), &snapshot)
    }

    /// Persist pending cache writes now
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    /// Flush the cache and stop its writer
    ///
    /// The graph itself is not saved; call [`save_snapshot`](Self::save_snapshot)
    /// first to keep it.
    pub fn shutdown(&self) -> Result<()> {
        self.cache.shutdown()?;
        log::info!("Context engine shut down");
        Ok(())
    }
}
