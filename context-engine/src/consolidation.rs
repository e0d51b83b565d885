//! Importance scoring and pruning
//!
//! Each node's importance blends three signals:
//!
//! ```text
//! stability = half_life * (1 + reinforcement * ln(1 + access_count))
//! recency   = 2^(-(now - last_access) / stability)
//! frequency = access_count / (access_count + frequency_saturation)
//! score     = w_recency * recency + w_frequency * frequency + w_hint * hint
//! ```
//!
//! Accesses lengthen the stability window, so a node that keeps being
//! recalled decays more slowly (spaced repetition). Nodes scoring below the
//! prune threshold are deleted unless an incident edge is heavier than the hub
//! threshold.
//!
//! The consolidator only plans; the engine applies the plan under its write
//! lock so pruning goes through the same path as an explicit delete.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ConsolidationConfig;
use crate::node::NodeId;
use crate::store::ScoringInput;
use crate::temporal::{hours_between, retention, stability_hours};

/// Result of one consolidation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub pruned_count: usize,
    pub pruned_ids: Vec<NodeId>,
    /// Nodes scored in this pass
    pub scored: usize,
    /// Low scorers kept alive by a hub edge
    pub protected: Vec<NodeId>,
}

/// What a pass intends to do, before it is applied
#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    pub scores: Vec<(NodeId, f32)>,
    pub prune: Vec<NodeId>,
    pub protected: Vec<NodeId>,
}

pub struct Consolidator {
    config: ConsolidationConfig,
}

impl Consolidator {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Importance of one node at `now`
    pub fn score(&self, input: &ScoringInput, now: DateTime<Utc>) -> f64 {
        let c = &self.config;
        let stability = stability_hours(c.half_life_hours, c.reinforcement, input.access_count);
        let recency = retention(hours_between(input.last_accessed, now), stability);

        let count = input.access_count as f64;
        let frequency = count / (count + c.frequency_saturation);

        let hint = f64::from(input.importance_hint.unwrap_or(0.0));

        c.recency_weight * recency + c.frequency_weight * frequency + c.hint_weight * hint
    }

    /// True when an incident edge is heavy enough to shield the node
    pub fn is_hub(&self, input: &ScoringInput) -> bool {
        input
            .max_edge_weight
            .is_some_and(|w| w > self.config.hub_weight_threshold)
    }

    /// Score every node and pick the pruning victims
    pub fn plan(&self, inputs: &[ScoringInput], now: DateTime<Utc>) -> ConsolidationPlan {
        let mut plan = ConsolidationPlan::default();
        for input in inputs {
            let score = self.score(input, now);
            plan.scores.push((input.id.clone(), score as f32));

            if score < self.config.prune_threshold {
                if self.is_hub(input) {
                    plan.protected.push(input.id.clone());
                } else {
                    plan.prune.push(input.id.clone());
                }
            }
        }
        plan.prune.sort();
        plan.protected.sort();
        plan
    }
}
