//! Embedding capability
//!
//! The engine never computes embeddings on its own: callers inject an
//! [`Embedder`] at construction. This module defines the trait plus two
//! implementations that need no model files: a memoizing wrapper and a
//! deterministic feature-hashing embedder.

mod engine;
mod hashing;

pub use engine::CachedEmbedder;
pub use hashing::{HashingConfig, HashingEmbedder};

use crate::error::InjectedError;

/// Text → vector capability supplied by the caller
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns
    fn dimension(&self) -> usize;

    /// Embed one text; errors are surfaced to the caller unchanged
    fn embed(&self, text: &str) -> Result<Vec<f32>, InjectedError>;
}

/// Adapts a closure into an [`Embedder`]
pub struct FnEmbedder<F> {
    dimension: usize,
    embed: F,
}

impl<F> FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>, InjectedError> + Send + Sync,
{
    pub fn new(dimension: usize, embed: F) -> Self {
        Self { dimension, embed }
    }
}

impl<F> Embedder for FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>, InjectedError> + Send + Sync,
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, InjectedError> {
        (self.embed)(text)
    }
}

impl<E: Embedder + ?Sized> Embedder for std::sync::Arc<E> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, InjectedError> {
        (**self).embed(text)
    }
}
