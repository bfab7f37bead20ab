//! Error types for the retrieval pipeline.
//!
//! Startup failures ([`RagError::Config`], [`RagError::IndexLoad`],
//! [`RagError::StoreLoad`], [`RagError::DimensionMismatch`]) are fatal: the
//! process refuses to serve queries. Everything else is scoped to a single
//! query and is reported at the query boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading artifacts or answering a query.
#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid settings, a missing credential, or a missing artifact file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The vector index file could not be read or is corrupt.
    #[error("Failed to load index {}: {message}", path.display())]
    IndexLoad { path: PathBuf, message: String },

    /// The document store file could not be read or is malformed.
    #[error("Failed to load document store {}: {message}", path.display())]
    StoreLoad { path: PathBuf, message: String },

    /// The embedder produces vectors of a different width than the index holds.
    #[error("Embedding dimension mismatch: embedder '{model}' produces {embedder} dims, index holds {index} dims")]
    DimensionMismatch {
        model: String,
        embedder: usize,
        index: usize,
    },

    /// A caller-supplied argument is out of its valid domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A passage id that the document store cannot resolve.
    #[error("Passage id {id} out of range (store holds {len} passages)")]
    OutOfRange { id: i64, len: usize },

    /// The embedding backend failed (after retries, for remote backends).
    #[error("Embedding error ({provider}): {cause}")]
    Embedding { provider: String, cause: String },

    /// The answer backend failed.
    #[error("Generation error ({provider}): {cause}")]
    Generation { provider: String, cause: String },
}

impl RagError {
    pub(crate) fn embedding(provider: impl Into<String>, cause: impl Into<String>) -> Self {
        RagError::Embedding {
            provider: provider.into(),
            cause: cause.into(),
        }
    }

    pub(crate) fn generation(provider: impl Into<String>, cause: impl Into<String>) -> Self {
        RagError::Generation {
            provider: provider.into(),
            cause: cause.into(),
        }
    }

    /// True for errors that must stop the process before it serves queries.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            RagError::Config(_)
                | RagError::IndexLoad { .. }
                | RagError::StoreLoad { .. }
                | RagError::DimensionMismatch { .. }
        )
    }
}

/// A convenience result type for pipeline operations.
pub type Result<T> = std::result::Result<T, RagError>;
