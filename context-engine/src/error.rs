//! Error types for context-engine

use thiserror::Error;

/// Boxed error raised by a caller-supplied capability (embedding function).
pub type InjectedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the context engine
#[derive(Debug, Error)]
pub enum ContextError {
    /// Reference to a missing node or edge
    #[error("Not found: {0}")]
    NotFound(String),

    /// Embedding length disagrees with the engine's fixed dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Cache configured with zero capacity received a put
    #[error("Cache capacity exceeded (capacity is zero)")]
    CapacityExceeded,

    /// Disk-tier or snapshot persistence failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The injected embedding function failed
    #[error("Embedding function failed: {0}")]
    InjectedFunction(#[source] InjectedError),

    /// Malformed input rejected before touching state
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid engine configuration
    #[error("Config error: {0}")]
    Config(String),

    /// A batch slot could not be executed (worker panicked or was cancelled)
    #[error("Batch task failed: {0}")]
    BatchTask(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContextError {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check a vector length against the engine dimension
    pub fn check_dimension(expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::DimensionMismatch { expected, actual })
        }
    }
}

impl From<bincode::Error> for ContextError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ContextError>;
