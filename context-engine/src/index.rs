//! Vector index with exact and HNSW search paths
//!
//! Small indexes are scanned exactly. Once the index reaches
//! `brute_force_threshold` vectors it builds an instant-distance HNSW graph
//! over a snapshot of the entries; vectors inserted after the build sit in a
//! pending list that is scanned exactly and merged with the graph candidates.
//! Every candidate is re-scored against the live entry map, so removed ids
//! never escape and results are always in ranking order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use instant_distance::{Builder, HnswMap, Point, Search};
use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::error::Result;
use crate::node::{validate_vector, NodeId, ScoredNode};

/// Similarity metric, fixed per engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    InnerProduct,
}

impl Metric {
    /// Higher is more similar
    pub fn similarity(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_similarity(a, b),
            Self::InnerProduct => dot(a, b),
        }
    }
}

/// Which search path queries currently take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    BruteForce,
    Approximate,
}

/// HNSW point wrapper
#[derive(Clone)]
struct IndexPoint {
    vector: Vec<f32>,
    metric: Metric,
}

impl Point for IndexPoint {
    fn distance(&self, other: &Self) -> f32 {
        // HNSW finds minimum distance
        match self.metric {
            Metric::Cosine => 1.0 - cosine_similarity(&self.vector, &other.vector),
            Metric::InnerProduct => -dot(&self.vector, &other.vector),
        }
    }
}

struct IndexEntry {
    vector: Vec<f32>,
    seq: u64,
}

struct HnswGraph {
    map: HnswMap<IndexPoint, NodeId>,
    /// Ids physically in the graph
    built: HashSet<NodeId>,
    /// Inserted or replaced after the build; scanned exactly
    pending: HashSet<NodeId>,
    /// Graph copies that were removed or replaced since the build
    stale: HashSet<NodeId>,
}

impl HnswGraph {
    fn mark_stale(&mut self, id: &NodeId) {
        if self.built.contains(id) {
            self.stale.insert(id.clone());
        }
    }

    fn drift(&self) -> usize {
        self.pending.len() + self.stale.len()
    }
}

struct Hit {
    id: NodeId,
    score: f32,
    seq: u64,
}

/// NaN ranks below every real score
fn rank_score(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// Ranking contract: similarity descending, then lower id, then earlier insert
fn rank(a: &Hit, b: &Hit) -> Ordering {
    rank_score(b.score)
        .total_cmp(&rank_score(a.score))
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// Nearest-neighbor index keyed by node id
pub struct VectorIndex {
    metric: Metric,
    dimension: usize,
    config: IndexConfig,
    entries: HashMap<NodeId, IndexEntry>,
    next_seq: u64,
    graph: Option<HnswGraph>,
    builds: u64,
}

impl VectorIndex {
    pub fn new(dimension: usize, metric: Metric, config: IndexConfig) -> Self {
        Self {
            metric,
            dimension,
            config,
            entries: HashMap::new(),
            next_seq: 0,
            graph: None,
            builds: 0,
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn mode(&self) -> IndexMode {
        if self.graph.is_some() {
            IndexMode::Approximate
        } else {
            IndexMode::BruteForce
        }
    }

    /// Add or replace the vector for `id`
    pub fn insert(&mut self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        self.put_entry(id, vector)?;
        self.maintain();
        Ok(())
    }

    /// Bulk insert with a single maintenance pass at the end
    pub fn extend<I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (NodeId, Vec<f32>)>,
    {
        for (id, vector) in items {
            self.put_entry(id, vector)?;
        }
        self.maintain();
        Ok(())
    }

    fn put_entry(&mut self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        validate_vector(&vector, self.dimension)?;

        let seq = self.next_seq;
        self.next_seq += 1;
        let replaced = self
            .entries
            .insert(id.clone(), IndexEntry { vector, seq })
            .is_some();

        if let Some(graph) = self.graph.as_mut() {
            if replaced {
                // the graph may still hold the old vector under this id
                graph.mark_stale(&id);
            }
            graph.pending.insert(id);
        }
        Ok(())
    }

    /// Drop `id`; returns whether it was present
    ///
    /// Removal only rebuilds the graph once half of it is stale. Dead graph
    /// hits are discarded when re-scored against live entries, and the next
    /// insert folds the drift into its own rebuild check.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        if let Some(graph) = self.graph.as_mut() {
            graph.pending.remove(id);
            graph.mark_stale(id);
        }

        let len = self.entries.len();
        let half_stale = self
            .graph
            .as_ref()
            .map_or(false, |graph| graph.stale.len() * 2 > graph.built.len());
        if len < self.config.brute_force_threshold || len == 0 {
            self.maintain();
        } else if half_stale {
            self.build_graph();
        }
        true
    }

    /// Top-`k` neighbors of `vector`, best first
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&NodeId) -> bool>,
    ) -> Result<Vec<ScoredNode>> {
        validate_vector(vector, self.dimension)?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let keep = |id: &NodeId| filter.map_or(true, |f| f(id));

        let mut hits = match &self.graph {
            None => self.scan(vector, self.entries.keys(), &keep),
            Some(graph) => self.search_graph(graph, vector, k, &keep),
        };

        hits.sort_by(rank);
        hits.truncate(k);
        Ok(hits
            .into_iter()
            .map(|hit| ScoredNode {
                id: hit.id,
                score: hit.score,
            })
            .collect())
    }

    /// Force a rebuild of the approximate structure (no-op below threshold)
    pub fn rebuild(&mut self) {
        if self.entries.len() >= self.config.brute_force_threshold && !self.entries.is_empty() {
            self.build_graph();
        } else {
            self.graph = None;
        }
    }

    fn scan<'a>(
        &self,
        vector: &[f32],
        ids: impl Iterator<Item = &'a NodeId>,
        keep: &dyn Fn(&NodeId) -> bool,
    ) -> Vec<Hit> {
        ids.filter(|id| keep(*id))
            .filter_map(|id| self.score(vector, id))
            .collect()
    }

    fn search_graph(
        &self,
        graph: &HnswGraph,
        vector: &[f32],
        k: usize,
        keep: &dyn Fn(&NodeId) -> bool,
    ) -> Vec<Hit> {
        let query_point = IndexPoint {
            vector: vector.to_vec(),
            metric: self.metric,
        };
        let budget = k.saturating_mul(self.config.candidate_multiplier);

        let mut search = Search::default();
        let mut seen: HashSet<&NodeId> = HashSet::new();
        let mut hits = Vec::new();

        for candidate in graph.map.search(&query_point, &mut search) {
            if hits.len() >= budget {
                break;
            }
            let id = candidate.value;
            if !keep(id) || !seen.insert(id) {
                continue;
            }
            // re-score against the live entry; removed ids drop out here
            if let Some(hit) = self.score(vector, id) {
                hits.push(hit);
            }
        }

        for id in &graph.pending {
            if keep(id) && seen.insert(id) {
                if let Some(hit) = self.score(vector, id) {
                    hits.push(hit);
                }
            }
        }

        hits
    }

    fn score(&self, vector: &[f32], id: &NodeId) -> Option<Hit> {
        self.entries.get(id).map(|entry| Hit {
            id: id.clone(),
            score: self.metric.similarity(vector, &entry.vector),
            seq: entry.seq,
        })
    }

    fn maintain(&mut self) {
        let len = self.entries.len();
        if len < self.config.brute_force_threshold || len == 0 {
            if self.graph.take().is_some() {
                log::debug!("Vector index below threshold ({len}), back to exact scan");
            }
            return;
        }

        let needs_build = match &self.graph {
            None => true,
            Some(graph) => {
                graph.drift() as f32 > graph.built.len() as f32 * self.config.rebuild_ratio
            }
        };
        if needs_build {
            self.build_graph();
        }
    }

    fn build_graph(&mut self) {
        let mut ordered: Vec<(&NodeId, &IndexEntry)> = self.entries.iter().collect();
        ordered.sort_by_key(|(_, entry)| entry.seq);

        let points: Vec<IndexPoint> = ordered
            .iter()
            .map(|(_, entry)| IndexPoint {
                vector: entry.vector.clone(),
                metric: self.metric,
            })
            .collect();
        let values: Vec<NodeId> = ordered.iter().map(|(id, _)| (*id).clone()).collect();
        let built: HashSet<NodeId> = values.iter().cloned().collect();
        let built_len = values.len();

        let map = Builder::default()
            .ef_construction(self.config.ef_construction)
            .ef_search(self.config.ef_search)
            .seed(self.config.seed)
            .build(points, values);

        log::debug!("Rebuilt HNSW graph over {built_len} vectors");
        self.builds += 1;
        self.graph = Some(HnswGraph {
            map,
            built,
            pending: HashSet::new(),
            stale: HashSet::new(),
        });
    }
}

// Accumulated in f64, where products of finite f32 components cannot overflow
fn dot64(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    dot64(a, b) as f32
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let norm_a = dot64(a, a).sqrt();
    let norm_b = dot64(b, b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot64(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0) as f32
    }
}
