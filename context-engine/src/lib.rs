//! Context Engine
//!
//! Shared semantic memory: a content-addressed graph of nodes and typed
//! edges, searchable by vector similarity, with deduplication, a tiered
//! cache and importance-based consolidation.
//!
//! ## Features
//!
//! - **Content-addressed nodes** - Ids are the SHA-256 of the content, so adding the same text twice is a no-op
//! - **Arena graph** - Directed, weighted, typed edges; cycles welcome; deletes cascade
//! - **Vector search** - Exact scan for small sets, HNSW (instant-distance) above a threshold, one ordering contract
//! - **Tiered cache** - LRU memory tier over a bincode disk tier written with atomic renames
//! - **Consolidation** - Forgetting-curve scoring with access reinforcement; hub edges protect their endpoints
//! - **Batches** - Bounded-parallel execution with results in submission order
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use context_engine::{ContextEngine, EngineConfig, HashingEmbedder, MetadataInput};
//!
//! let engine = ContextEngine::new(
//!     EngineConfig::with_dimension(256),
//!     Arc::new(HashingEmbedder::new(256)),
//! )?;
//!
//! let id = engine.add_node(
//!     "Nginx rejects uploads over 1MB; raise client_max_body_size",
//!     None,
//!     MetadataInput::new().tag("nginx").importance(0.8),
//! )?;
//!
//! let hits = engine.query_text("upload size limit", 5, None)?;
//! assert_eq!(hits[0].id, id);
//!
//! engine.consolidate();
//! engine.shutdown()?;
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod consolidation;
pub mod dedup;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod node;
pub mod snapshot;
pub mod store;
pub mod temporal;

// Re-exports for convenience
pub use batch::{BatchOp, BatchOutput, BatchScheduler};
pub use cache::{CacheStats, TieredCache};
pub use config::{BatchConfig, CacheConfig, ConsolidationConfig, EngineConfig, IndexConfig};
pub use consolidation::ConsolidationReport;
pub use embedding::{CachedEmbedder, Embedder, FnEmbedder, HashingEmbedder};
pub use engine::{ContextEngine, EngineStats, QueryFilter};
pub use error::{ContextError, InjectedError, Result};
pub use index::{IndexMode, Metric, VectorIndex};
pub use node::{Edge, EdgeId, MetadataInput, Node, NodeId, NodeMetadata, ScoredNode};
pub use store::NodeMetadataView;
pub use temporal::{Clock, ManualClock, SystemClock};
