//! Engine configuration
//!
//! Every section has serde defaults, so a TOML file only needs to name the
//! fields it changes:
//!
//! ```toml
//! dimension = 256
//! metric = "cosine"
//!
//! [cache]
//! capacity = 2048
//! disk_path = ".context/cache.bin"
//!
//! [consolidation]
//! half_life_hours = 48.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, Result};
use crate::index::Metric;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed embedding length for every node in this engine
    pub dimension: usize,
    /// Similarity metric used by the vector index
    pub metric: Metric,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub consolidation: ConsolidationConfig,
    pub batch: BatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: 256,
            metric: Metric::Cosine,
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
            consolidation: ConsolidationConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults with a specific dimension
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ContextError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::info!("Loaded engine config from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(ContextError::config("dimension must be greater than zero"));
        }
        if !(self.index.rebuild_ratio.is_finite() && self.index.rebuild_ratio > 0.0) {
            return Err(ContextError::config("index.rebuild_ratio must be positive"));
        }
        if self.index.candidate_multiplier == 0 {
            return Err(ContextError::config("index.candidate_multiplier must be at least 1"));
        }
        if self.batch.max_parallel == 0 {
            return Err(ContextError::config("batch.max_parallel must be at least 1"));
        }
        self.consolidation.validate()
    }
}

/// Vector index tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Below this many vectors queries scan exactly
    pub brute_force_threshold: usize,
    /// Rebuild the HNSW graph once pending inserts exceed this share of it
    pub rebuild_ratio: f32,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// HNSW candidates drawn per requested result
    pub candidate_multiplier: usize,
    /// Seed for HNSW layer assignment, so rebuilds are reproducible
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            brute_force_threshold: 1024,
            rebuild_ratio: 0.25,
            ef_construction: 100,
            ef_search: 100,
            candidate_multiplier: 4,
            seed: 0x5eed,
        }
    }
}

/// Tiered cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory-tier entry limit; zero makes every put fail
    pub capacity: usize,
    /// TTL applied by the engine when warming the cache
    pub default_ttl_secs: u64,
    /// Disk-tier file; `None` keeps the cache memory-only
    pub disk_path: Option<PathBuf>,
    /// Disk-tier record limit
    pub disk_capacity: usize,
    /// Persistence attempts before a flush reports failure
    pub max_retries: u32,
    /// Backoff before the first retry; doubles each attempt
    pub retry_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            default_ttl_secs: 300,
            disk_path: None,
            disk_capacity: 10_000,
            max_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Importance scoring and pruning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// `tick()` consolidates after this many writes; zero disables the trigger
    pub every_n_writes: u64,
    /// Hours for an unaccessed node's recency to halve
    pub half_life_hours: f64,
    /// How strongly each access stretches the half-life
    pub reinforcement: f64,
    /// Access count at which the frequency term reaches one half
    pub frequency_saturation: f64,
    pub recency_weight: f64,
    pub frequency_weight: f64,
    pub hint_weight: f64,
    /// Nodes scoring strictly below this are pruning candidates
    pub prune_threshold: f64,
    /// Edges heavier than this protect both endpoints
    pub hub_weight_threshold: f32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            every_n_writes: 1000,
            half_life_hours: 24.0,
            reinforcement: 1.0,
            frequency_saturation: 5.0,
            recency_weight: 0.5,
            frequency_weight: 0.2,
            hint_weight: 0.3,
            prune_threshold: 0.1,
            hub_weight_threshold: 0.8,
        }
    }
}

impl ConsolidationConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("half_life_hours", self.half_life_hours),
            ("frequency_saturation", self.frequency_saturation),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ContextError::config(format!(
                    "consolidation.{name} must be positive"
                )));
            }
        }
        let non_negative = [
            ("reinforcement", self.reinforcement),
            ("recency_weight", self.recency_weight),
            ("frequency_weight", self.frequency_weight),
            ("hint_weight", self.hint_weight),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ContextError::config(format!(
                    "consolidation.{name} must be non-negative"
                )));
            }
        }
        if !self.prune_threshold.is_finite() || !self.hub_weight_threshold.is_finite() {
            return Err(ContextError::config("consolidation thresholds must be finite"));
        }
        Ok(())
    }
}

/// Batch scheduler limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker permits for one batch
    pub max_parallel: usize,
    /// Batches shorter than this run sequentially
    pub sequential_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            sequential_threshold: 4,
        }
    }
}
