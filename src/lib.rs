use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dimension mismatch: store expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding backend unavailable after {attempts} attempt(s): {reason}")]
    EmbeddingUnavailable { attempts: u32, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ContextError {
    #[inline]
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<sqlx::Error> for ContextError {
    #[inline]
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ContextError {
    #[inline]
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::StoreUnavailable(format!("Failed to run schema migration: {}", err))
    }
}

pub mod config;
pub mod context;
pub mod database;
pub mod embeddings;

pub use context::{ContextManager, RetrievedChunk, SourceDocument};
pub use database::{ChunkId, Metadata, MetadataValue, SourceKind, VectorStore};
