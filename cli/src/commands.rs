//! Subcommands and their JSON output

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Subcommand;
use context_engine::{
    BatchOp, BatchOutput, BatchScheduler, ContextEngine, MetadataInput, NodeId, QueryFilter,
};
use serde_json::{json, Value};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store one or more pieces of content (duplicates return the existing id)
    Add {
        #[arg(required = true)]
        contents: Vec<String>,
        /// Tag attached to every added node (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Importance hint in [0, 1]
        #[arg(long)]
        importance: Option<f32>,
    },

    /// Create a directed edge between two nodes
    Link {
        src: NodeId,
        dst: NodeId,
        relation: String,
        #[arg(long, default_value_t = 1.0)]
        weight: f32,
    },

    /// Print a node (counts as an access)
    Get { id: NodeId },

    /// Nearest nodes to a text query
    Query {
        text: String,
        #[arg(short = 'k', long, default_value_t = 5)]
        limit: usize,
        /// Require this tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        min_importance: Option<f32>,
    },

    /// Follow edges out of (or into) a node
    Neighbors {
        id: NodeId,
        #[arg(long)]
        relation: Option<String>,
        #[arg(long)]
        incoming: bool,
    },

    /// Remove a node and its edges
    Delete { id: NodeId },

    /// Score every node and prune the faded ones
    Consolidate,

    /// Engine counters
    Stats,
}

impl Command {
    /// Whether the graph must be saved afterwards
    ///
    /// `get` bumps access counters, which consolidation reads.
    pub fn mutates(&self) -> bool {
        !matches!(self, Self::Query { .. } | Self::Neighbors { .. } | Self::Stats)
    }

    pub async fn run(self, engine: &Arc<ContextEngine>) -> anyhow::Result<Value> {
        match self {
            Self::Add {
                contents,
                tags,
                importance,
            } => {
                let mut metadata = MetadataInput::new().tags(tags);
                if let Some(hint) = importance {
                    metadata = metadata.importance(hint);
                }
                let ops = contents
                    .into_iter()
                    .map(|content| BatchOp::AddNode {
                        content,
                        embedding: None,
                        metadata: metadata.clone(),
                    })
                    .collect();

                let scheduler = BatchScheduler::new(Arc::clone(engine));
                let mut ids = Vec::new();
                for result in scheduler.execute(ops).await {
                    match result? {
                        BatchOutput::NodeId(id) => ids.push(id),
                        other => bail!("unexpected batch output {:?}", other),
                    }
                }
                Ok(json!({ "ids": ids }))
            }
            Self::Link {
                src,
                dst,
                relation,
                weight,
            } => {
                let edge = engine.add_edge(&src, &dst, &relation, weight)?;
                Ok(serde_json::to_value(engine.get_edge(edge)?)?)
            }
            Self::Get { id } => {
                let node = engine.get_node(&id)?;
                Ok(json!({
                    "id": node.id,
                    "content": node.content,
                    "metadata": node.metadata,
                }))
            }
            Self::Query {
                text,
                limit,
                tags,
                min_importance,
            } => {
                let mut filter = QueryFilter::new();
                for tag in tags {
                    filter = filter.tag(tag);
                }
                if let Some(min) = min_importance {
                    filter = filter.min_importance(min);
                }
                let hits = engine.query_text(&text, limit, Some(&filter))?;
                Ok(json!({ "hits": hits }))
            }
            Self::Neighbors {
                id,
                relation,
                incoming,
            } => {
                let ids: Vec<NodeId> = if incoming {
                    engine.incoming(&id, relation.as_deref())?.collect()
                } else {
                    engine.neighbors(&id, relation.as_deref())?.collect()
                };
                Ok(json!({ "ids": ids }))
            }
            Self::Delete { id } => {
                let deleted = engine.delete_node(&id);
                Ok(json!({ "deleted": deleted }))
            }
            Self::Consolidate => Ok(serde_json::to_value(engine.consolidate())?),
            Self::Stats => Ok(serde_json::to_value(engine.stats())?),
        }
    }
}

/// Save the graph to `path` if the command changed it
pub fn persist(engine: &ContextEngine, mutated: bool, path: &Path) -> anyhow::Result<()> {
    if mutated {
        engine
            .save_snapshot(path)
            .with_context(|| format!("Failed to save graph to {}", path.display()))?;
    }
    Ok(())
}
