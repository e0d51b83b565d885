//! Memoizing embedder
//!
//! Wraps any [`Embedder`] with a DashMap cache for repeated texts.

use dashmap::DashMap;

use super::Embedder;
use crate::error::InjectedError;

/// Embedder wrapper with per-text caching
///
/// Failures are not cached, so a flaky provider is retried on the next call
/// by the caller, never internally.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: DashMap<String, Vec<f32>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    /// Batch embed with caching, preserving input order
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, InjectedError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, InjectedError> {
        // Check cache first
        if let Some(cached) = self.cache.get(text) {
            return Ok(cached.clone());
        }

        // Generate and cache
        let embedding = self.inner.embed(text)?;
        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }
}
