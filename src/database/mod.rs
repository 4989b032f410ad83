// Database module
// Vector stores holding chunk records and their embeddings, partitioned by library

pub mod locks;
pub mod memory;
pub mod models;
pub mod ranking;
pub mod sqlite;

use async_trait::async_trait;

pub use memory::MemoryVectorStore;
pub use models::{
    ChunkId, Metadata, MetadataValue, NewChunk, ScoredChunk, SourceKind, StoredChunk,
};
pub use sqlite::SqliteVectorStore;

use crate::Result;

/// Persistent collection of chunks with fixed-dimension vectors.
///
/// Every operation is atomic with respect to the others: a failed write leaves the
/// store unchanged, and a search sees either all or none of a concurrent write.
/// Search is a full scan today; the interface leaves room for an ANN index.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Dimensionality every stored and queried vector must have
    fn dimension(&self) -> usize;

    /// Store a batch of chunks, returning their new ids in input order
    async fn insert(&self, chunks: Vec<NewChunk>) -> Result<Vec<ChunkId>>;

    /// Rank chunks by cosine similarity to `query`, best first, ties by ascending id
    async fn search(
        &self,
        query: &[f32],
        library: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove every chunk of a library, returning how many were removed
    async fn delete_by_library(&self, library: &str) -> Result<u64>;

    /// Number of chunks in one library, or in the whole store
    async fn count(&self, library: Option<&str>) -> Result<u64>;

    /// Swap a library's contents for `chunks` in one step
    async fn replace_library(&self, library: &str, chunks: Vec<NewChunk>) -> Result<Vec<ChunkId>>;

    /// Every library with its chunk count, ordered by name
    async fn libraries(&self) -> Result<Vec<(String, u64)>>;
}

/// Check a query vector against the store dimension and reject NaN or infinite values
#[inline]
pub fn check_query(query: &[f32], dimension: usize) -> Result<()> {
    if query.len() != dimension {
        return Err(crate::ContextError::DimensionMismatch {
            expected: dimension,
            actual: query.len(),
        });
    }
    if query.iter().any(|value| !value.is_finite()) {
        return Err(crate::ContextError::InvalidChunk(
            "query vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}
