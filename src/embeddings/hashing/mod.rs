
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{BackendError, EmbeddingBackend};

/// Names the token hash, so stores built by a different scheme are flagged on open
const MODEL_NAME: &str = "feature-hashing-sha256-v1";

/// Offline embedding backend based on the hashing trick.
///
/// Each lower-cased word is hashed with SHA-256 into one of `dimension` buckets with a
/// hash-derived sign, and the resulting vector is L2-normalised. Texts sharing
/// vocabulary end up with high cosine similarity, which is enough for tests and for
/// running without an embedding server. Vectors do not depend on the toolchain, so
/// a persisted store stays searchable across builds.
#[derive(Debug, Clone)]
pub struct HashingBackend {
    dimension: usize,
}

impl HashingBackend {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed a single text without going through the async trait
    #[inline]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let hash = digest
                .iter()
                .take(8)
                .fold(0_u64, |acc, &byte| (acc << 8) | u64::from(byte));

            let bucket = usize::try_from(hash % self.dimension as u64).unwrap_or_default();
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for x in &mut vector {
                *x /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingBackend for HashingBackend {
    #[inline]
    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let vectors: Vec<Vec<f32>> = texts.iter().map(|text| self.embed_text(text)).collect();
        debug!("Generated {} hashed embeddings", vectors.len());
        Ok(vectors)
    }
}
