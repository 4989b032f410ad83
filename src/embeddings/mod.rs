// Embeddings module
// Chunking of source text and the embedding backends that turn chunks into vectors

pub mod chunking;
pub mod embedder;
pub mod hashing;
pub mod ollama;

use async_trait::async_trait;
use thiserror::Error;

pub use chunking::{ChunkSpan, Chunker, ChunkingConfig, chunk_text};
pub use embedder::{Embedder, RetryPolicy};
pub use hashing::HashingBackend;
pub use ollama::OllamaBackend;

/// Outcome of a single failed backend call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Timeouts, rate limits and server-side failures; worth another attempt
    #[error("retryable backend error: {0}")]
    Retryable(String),
    /// Bad requests, unknown models and malformed responses
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// A model or service that turns texts into fixed-dimension vectors.
///
/// Implementations make exactly one attempt per call; batching and retries live in
/// [`Embedder`].
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Identifier of the model producing the vectors
    fn model_name(&self) -> &str;

    /// Dimensionality of every vector this backend returns
    fn dimension(&self) -> usize;

    /// Embed `texts`, returning one vector per input in the same order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;
}
