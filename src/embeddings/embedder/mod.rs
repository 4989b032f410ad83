#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use super::{BackendError, EmbeddingBackend};
use crate::config::EmbeddingConfig;
use crate::{ContextError, Result};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Bounded retry schedule for transient backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Wait before attempt `attempt + 1`, doubling each time up to `max_delay`
    #[inline]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Batches texts through an [`EmbeddingBackend`] with bounded retries.
///
/// Results keep a 1:1 index correspondence with the input and every vector is
/// checked against the backend's declared dimension.
#[derive(Clone)]
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Embedder {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model", &self.backend.model_name())
            .field("dimension", &self.backend.dimension())
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Embedder {
    #[inline]
    pub fn new(backend: Arc<dyn EmbeddingBackend>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(ContextError::Config(
                "Embedding batch size must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            backend,
            batch_size,
            retry: RetryPolicy::default(),
        })
    }

    #[inline]
    pub fn from_config(backend: Arc<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(backend, config.batch_size)?.with_retry_policy(RetryPolicy::from_config(config)))
    }

    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    #[inline]
    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embed any number of texts, splitting them into backend-sized batches
    #[inline]
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Generating embeddings for {} texts in batches of {}",
            texts.len(),
            self.batch_size
        );

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let batch_vectors = self.embed_with_retry(batch).await?;
            vectors.extend(batch_vectors);
        }

        debug!("Generated {} embeddings total", vectors.len());
        Ok(vectors)
    }

    /// Embed a single text
    #[inline]
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| ContextError::EmbeddingUnavailable {
            attempts: 1,
            reason: "backend returned no embedding".to_string(),
        })
    }

    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            debug!(
                "Embedding attempt {}/{} for {} texts",
                attempt,
                self.retry.max_attempts,
                batch.len()
            );

            match self.backend.embed(batch).await {
                Ok(vectors) => return self.check_vectors(batch.len(), vectors, attempt),
                Err(BackendError::Fatal(reason)) => {
                    error!("Embedding backend failed permanently: {}", reason);
                    return Err(ContextError::EmbeddingUnavailable {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(BackendError::Retryable(reason)) => {
                    warn!(
                        "Transient embedding failure, attempt {}/{}: {}",
                        attempt, self.retry.max_attempts, reason
                    );
                    last_error = reason;

                    if attempt < self.retry.max_attempts {
                        let delay = self.retry.delay_after(attempt);
                        debug!("Waiting {:?} before retry", delay);
                        sleep(delay).await;
                    }
                }
            }
        }

        error!(
            "All {} embedding attempts failed for model {}",
            self.retry.max_attempts,
            self.backend.model_name()
        );
        Err(ContextError::EmbeddingUnavailable {
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }

    fn check_vectors(
        &self,
        expected_count: usize,
        vectors: Vec<Vec<f32>>,
        attempt: u32,
    ) -> Result<Vec<Vec<f32>>> {
        if vectors.len() != expected_count {
            return Err(ContextError::EmbeddingUnavailable {
                attempts: attempt,
                reason: format!(
                    "Mismatch between request and response counts: {} vs {}",
                    expected_count,
                    vectors.len()
                ),
            });
        }

        let dimension = self.backend.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(ContextError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        Ok(vectors)
    }
}
