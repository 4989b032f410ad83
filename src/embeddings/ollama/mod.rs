
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{BackendError, EmbeddingBackend};
use crate::config::{ConfigError, OllamaConfig};

/// Embedding backend talking to an Ollama server over HTTP.
///
/// Each call to [`EmbeddingBackend::embed`] makes exactly one request to `/api/embed`;
/// failures are classified so the [`Embedder`](super::Embedder) knows which ones to retry.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    base_url: Url,
    model: String,
    dimension: usize,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    inputs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
pub struct ModelDetails {
    pub format: Option<String>,
    pub family: Option<String>,
    pub families: Option<Vec<String>>,
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

impl OllamaBackend {
    #[inline]
    pub fn new(config: &OllamaConfig, dimension: usize) -> Result<Self, ConfigError> {
        let base_url = config.ollama_url()?;

        Ok(Self {
            base_url,
            model: config.model.clone(),
            dimension,
            agent: build_agent(config.timeout()),
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Test connection to Ollama server and verify model availability
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        self.ping().context("Server ping failed")?;
        self.validate_model().context("Model validation failed")?;

        info!(
            "Health check passed for Ollama server at {} with model {}",
            self.base_url, self.model
        );
        Ok(())
    }

    /// Ping the Ollama server to check if it's responsive
    #[inline]
    pub fn ping(&self) -> Result<()> {
        let url = self
            .base_url
            .join("/api/tags")
            .context("Failed to build ping URL")?;

        debug!("Pinging Ollama server at {}", url);

        self.agent
            .get(url.as_str())
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .context("Failed to ping Ollama server")?;

        debug!("Server ping successful");
        Ok(())
    }

    /// Validate that the configured model is available
    #[inline]
    pub fn validate_model(&self) -> Result<()> {
        debug!("Validating model: {}", self.model);

        let models = self.list_models().context("Failed to list models")?;

        if models.iter().any(|m| m.name == self.model) {
            debug!("Model {} is available", self.model);
            Ok(())
        } else {
            let available_models: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
            warn!(
                "Model {} not found. Available models: {:?}",
                self.model, available_models
            );
            Err(anyhow::anyhow!(
                "Model '{}' is not available. Available models: {:?}",
                self.model,
                available_models
            ))
        }
    }

    /// List all available models
    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self
            .base_url
            .join("/api/tags")
            .context("Failed to build models URL")?;

        debug!("Fetching available models from {}", url);

        let response_text = self
            .agent
            .get(url.as_str())
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .context("Failed to fetch models")?;

        let models_response: ModelsResponse =
            serde_json::from_str(&response_text).context("Failed to parse models response")?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    /// One blocking request to the batch embedding endpoint
    fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let url = self
            .base_url
            .join("/api/embed")
            .map_err(|e| BackendError::Fatal(format!("Failed to build embedding URL: {e}")))?;

        let request = EmbedRequest {
            model: &self.model,
            inputs: texts,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| BackendError::Fatal(format!("Failed to serialize request: {e}")))?;

        debug!(
            "Requesting {} embeddings from {} with model {}",
            texts.len(),
            url,
            self.model
        );

        let response_text = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(|error| classify_error(&error))?;

        let response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            BackendError::Fatal(format!("Failed to parse embedding response: {e}"))
        })?;

        Ok(response.embeddings)
    }
}

/// Sort transport and HTTP failures into ones worth retrying and ones that are not
fn classify_error(error: &ureq::Error) -> BackendError {
    match error {
        ureq::Error::StatusCode(status) => {
            if *status == 429 || *status >= 500 {
                warn!("Server error (status {}), request may be retried", status);
                BackendError::Retryable(format!("HTTP {status}"))
            } else {
                warn!("Client error (status {}), not retrying", status);
                BackendError::Fatal(format!("Client error: HTTP {status}"))
            }
        }
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => {
            warn!("Transport error: {}", error);
            BackendError::Retryable(format!("Transport error: {error}"))
        }
        _ => {
            warn!("Non-retryable error: {}", error);
            BackendError::Fatal(format!("Non-retryable error: {error}"))
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    #[inline]
    fn model_name(&self) -> &str {
        &self.model
    }

    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let backend = self.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || backend.request_embeddings(&texts))
            .await
            .map_err(|e| BackendError::Fatal(format!("Embedding task failed: {e}")))?
    }
}
