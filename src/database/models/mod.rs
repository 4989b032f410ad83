
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::{ContextError, Result};

/// Store-assigned chunk identifier; increases with insertion order and is never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub i64);

impl std::fmt::Display for ChunkId {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a chunk's text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Documentation,
    GithubReadme,
    GithubCode,
    CodeExample,
}

impl SourceKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Documentation => "documentation",
            Self::GithubReadme => "github_readme",
            Self::GithubCode => "github_code",
            Self::CodeExample => "code_example",
        }
    }

    /// Sources chunked in code-aware mode
    #[inline]
    pub fn is_code(self) -> bool {
        matches!(self, Self::GithubCode | Self::CodeExample)
    }
}

impl std::fmt::Display for SourceKind {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ContextError;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "documentation" => Ok(Self::Documentation),
            "github_readme" => Ok(Self::GithubReadme),
            "github_code" => Ok(Self::GithubCode),
            "code_example" => Ok(Self::CodeExample),
            other => Err(ContextError::InvalidChunk(format!(
                "unknown source kind '{other}'"
            ))),
        }
    }
}

/// A metadata value; the store passes these through untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for MetadataValue {
    #[inline]
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for MetadataValue {
    #[inline]
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or_else(|_| Self::Text(value.to_string()), Self::Integer)
    }
}

impl From<f64> for MetadataValue {
    #[inline]
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    #[inline]
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    #[inline]
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A chunk ready to be stored; `id` and `created_at` are assigned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub library: String,
    pub source_kind: SourceKind,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

impl NewChunk {
    /// Check the record against a store of the given dimensionality
    #[inline]
    pub fn validate(&self, dimension: usize) -> Result<()> {
        validate_library(&self.library)?;

        if self.text.is_empty() {
            return Err(ContextError::InvalidChunk(format!(
                "empty text for library '{}'",
                self.library
            )));
        }

        if self.vector.len() != dimension {
            return Err(ContextError::DimensionMismatch {
                expected: dimension,
                actual: self.vector.len(),
            });
        }

        if self.vector.iter().any(|x| !x.is_finite()) {
            return Err(ContextError::InvalidChunk(
                "vector contains non-finite values".to_string(),
            ));
        }

        Ok(())
    }
}

/// Reject library names no store can partition on
#[inline]
pub fn validate_library(library: &str) -> Result<()> {
    if library.trim().is_empty() {
        return Err(ContextError::InvalidChunk(
            "library name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validate a whole batch before any of it is written
#[inline]
pub fn validate_batch(chunks: &[NewChunk], dimension: usize) -> Result<()> {
    chunks.iter().try_for_each(|chunk| chunk.validate(dimension))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: ChunkId,
    pub library: String,
    pub source_kind: SourceKind,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl StoredChunk {
    #[inline]
    pub fn from_new(id: ChunkId, chunk: NewChunk, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            library: chunk.library,
            source_kind: chunk.source_kind,
            text: chunk.text,
            vector: chunk.vector,
            metadata: chunk.metadata,
            created_at,
        }
    }
}

/// A search hit, without its vector
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub id: ChunkId,
    pub library: String,
    pub source_kind: SourceKind,
    pub text: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub score: f32,
}

impl ScoredChunk {
    #[inline]
    pub fn from_stored(chunk: &StoredChunk, score: f32) -> Self {
        Self {
            id: chunk.id,
            library: chunk.library.clone(),
            source_kind: chunk.source_kind,
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
            created_at: chunk.created_at,
            score,
        }
    }
}
