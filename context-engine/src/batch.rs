//! Batch execution of independent engine operations
//!
//! Operations run on tokio's blocking pool, at most `max_parallel` at a time,
//! and their results come back in submission order. Each slot carries its own
//! `Result`: a failing or panicking operation does not disturb its siblings.
//! Small batches, and hosts with a single CPU, run strictly in order on one
//! blocking thread.
//!
//! ```ignore
//! let scheduler = BatchScheduler::new(Arc::clone(&engine));
//! let results = scheduler
//!     .execute(vec![
//!         BatchOp::add("note one", None),
//!         BatchOp::QueryText { text: "note".into(), k: 5, filter: None },
//!     ])
//!     .await;
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::engine::{ContextEngine, QueryFilter};
use crate::error::{ContextError, Result};
use crate::node::{EdgeId, MetadataInput, Node, NodeId, ScoredNode};

/// One independent engine operation
#[derive(Debug, Clone)]
pub enum BatchOp {
    AddNode {
        content: String,
        embedding: Option<Vec<f32>>,
        metadata: MetadataInput,
    },
    AddEdge {
        src: NodeId,
        dst: NodeId,
        relation: String,
        weight: f32,
    },
    GetNode(NodeId),
    DeleteNode(NodeId),
    Query {
        vector: Vec<f32>,
        k: usize,
        filter: Option<QueryFilter>,
    },
    QueryText {
        text: String,
        k: usize,
        filter: Option<QueryFilter>,
    },
    Neighbors {
        id: NodeId,
        relation: Option<String>,
    },
}

impl BatchOp {
    /// `AddNode` with default metadata
    pub fn add(content: impl Into<String>, embedding: Option<Vec<f32>>) -> Self {
        Self::AddNode {
            content: content.into(),
            embedding,
            metadata: MetadataInput::default(),
        }
    }

    /// Run against `engine` on the current thread
    pub fn apply(self, engine: &ContextEngine) -> Result<BatchOutput> {
        match self {
            Self::AddNode {
                content,
                embedding,
                metadata,
            } => engine
                .add_node(content, embedding, metadata)
                .map(BatchOutput::NodeId),
            Self::AddEdge {
                src,
                dst,
                relation,
                weight,
            } => engine
                .add_edge(&src, &dst, &relation, weight)
                .map(BatchOutput::EdgeId),
            Self::GetNode(id) => engine.get_node(&id).map(BatchOutput::Node),
            Self::DeleteNode(id) => Ok(BatchOutput::Deleted(engine.delete_node(&id))),
            Self::Query { vector, k, filter } => engine
                .query(&vector, k, filter.as_ref())
                .map(BatchOutput::Hits),
            Self::QueryText { text, k, filter } => engine
                .query_text(&text, k, filter.as_ref())
                .map(BatchOutput::Hits),
            Self::Neighbors { id, relation } => engine
                .neighbors(&id, relation.as_deref())
                .map(|ids| BatchOutput::Neighbors(ids.collect())),
        }
    }
}

/// Successful result of one [`BatchOp`]
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutput {
    NodeId(NodeId),
    EdgeId(EdgeId),
    Node(Node),
    Deleted(bool),
    Hits(Vec<ScoredNode>),
    Neighbors(Vec<NodeId>),
}

fn apply_guarded(op: BatchOp, engine: &ContextEngine) -> Result<BatchOutput> {
    catch_unwind(AssertUnwindSafe(|| op.apply(engine))).unwrap_or_else(|panic| {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "operation panicked".to_string());
        Err(ContextError::BatchTask(msg))
    })
}

/// Bounded-parallel executor over a shared engine
pub struct BatchScheduler {
    engine: Arc<ContextEngine>,
    max_parallel: usize,
    sequential_threshold: usize,
}

impl BatchScheduler {
    /// Limits come from the engine's `[batch]` config
    pub fn new(engine: Arc<ContextEngine>) -> Self {
        let batch = engine.config().batch.clone();
        Self {
            engine,
            max_parallel: batch.max_parallel.max(1),
            sequential_threshold: batch.sequential_threshold,
        }
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_sequential_threshold(mut self, threshold: usize) -> Self {
        self.sequential_threshold = threshold;
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Whether a batch of `len` operations would skip the worker pool
    pub fn runs_sequentially(&self, len: usize) -> bool {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        len < self.sequential_threshold || self.max_parallel == 1 || cpus == 1
    }

    /// Apply every operation in order on the calling thread
    pub fn run_sequential(&self, ops: Vec<BatchOp>) -> Vec<Result<BatchOutput>> {
        ops.into_iter()
            .map(|op| apply_guarded(op, &self.engine))
            .collect()
    }

    /// Execute a batch; results are in submission order
    pub async fn execute(&self, ops: Vec<BatchOp>) -> Vec<Result<BatchOutput>> {
        if ops.is_empty() {
            return Vec::new();
        }

        let len = ops.len();
        if self.runs_sequentially(len) {
            log::debug!("Running batch of {} operations sequentially", len);
            let engine = Arc::clone(&self.engine);
            let run = tokio::task::spawn_blocking(move || {
                ops.into_iter()
                    .map(|op| apply_guarded(op, &engine))
                    .collect::<Vec<_>>()
            });
            return match run.await {
                Ok(results) => results,
                Err(e) => (0..len)
                    .map(|_| Err(ContextError::BatchTask(e.to_string())))
                    .collect(),
            };
        }

        log::debug!(
            "Running batch of {} operations with up to {} workers",
            len,
            self.max_parallel
        );
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let tasks: Vec<_> = ops
            .into_iter()
            .map(|op| {
                let engine = Arc::clone(&self.engine);
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(e) => return Err(ContextError::BatchTask(e.to_string())),
                    };
                    match tokio::task::spawn_blocking(move || op.apply(&engine)).await {
                        Ok(result) => result,
                        // the operation panicked or was cancelled
                        Err(e) => Err(ContextError::BatchTask(e.to_string())),
                    }
                }
            })
            .collect();

        join_all(tasks).await
    }
}
