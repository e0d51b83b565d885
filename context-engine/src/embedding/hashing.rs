//! Feature-hashing embeddings
//!
//! Deterministic bag-of-words vectors with no model files: each token is
//! hashed into a bucket with a sign bit, token vectors are mean-pooled, and
//! the result is optionally L2-normalized. Texts sharing vocabulary land
//! close together under cosine similarity, which is enough for local hosts,
//! tests and benchmarks.

use sha2::{Digest, Sha256};

use super::Embedder;
use crate::error::InjectedError;

/// Hashing embedder configuration
#[derive(Debug, Clone)]
pub struct HashingConfig {
    /// Output dimension (default: 256)
    pub dimension: usize,
    /// Maximum tokens considered per text (default: 512)
    pub max_tokens: usize,
    /// Whether to normalize embeddings (default: true)
    pub normalize: bool,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            dimension: 256,
            max_tokens: 512,
            normalize: true,
        }
    }
}

/// Deterministic feature-hashing embedder
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    config: HashingConfig,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self::with_config(HashingConfig {
            dimension,
            ..HashingConfig::default()
        })
    }

    pub fn with_config(config: HashingConfig) -> Self {
        Self { config }
    }

    /// Get configuration
    pub fn config(&self) -> &HashingConfig {
        &self.config
    }

    /// Lowercased alphanumeric runs
    fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(raw);
        let index = (hash % self.config.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, InjectedError> {
        if self.config.dimension == 0 {
            return Err("hashing embedder dimension must be greater than zero".into());
        }

        let mut vector = vec![0.0_f32; self.config.dimension];
        let mut count = 0usize;
        for token in Self::tokenize(text).take(self.config.max_tokens) {
            let (index, sign) = self.bucket(&token);
            vector[index] += sign;
            count += 1;
        }

        if count > 0 {
            for x in &mut vector {
                *x /= count as f32;
            }
        }

        if self.config.normalize {
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in &mut vector {
                    *x /= norm;
                }
            }
        }

        Ok(vector)
    }
}
