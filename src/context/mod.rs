
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BackendKind, Config, RetrievalConfig};
use crate::database::models::validate_library;
use crate::database::ranking::sort_ranked;
use crate::database::{
    ChunkId, Metadata, MetadataValue, NewChunk, ScoredChunk, SourceKind, SqliteVectorStore,
    VectorStore,
};
use crate::embeddings::{
    ChunkSpan, Chunker, Embedder, EmbeddingBackend, HashingBackend, OllamaBackend,
};
use crate::{ContextError, Result};

/// Phrases that mark a query as asking for examples
const EXAMPLE_KEYWORDS: [&str; 3] = ["example", "how to", "usage"];

/// Estimates how many model tokens a text will cost
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Fixed characters-per-token ratio, rounded up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    #[inline]
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    #[inline]
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    #[inline]
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// A document handed over for indexing
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub text: String,
    pub source_kind: SourceKind,
    pub metadata: Metadata,
}

impl SourceDocument {
    #[inline]
    pub fn new(text: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            text: text.into(),
            source_kind,
            metadata: Metadata::new(),
        }
    }

    /// A documentation page fetched from `url`
    #[inline]
    pub fn documentation(text: impl Into<String>, url: &str) -> Self {
        Self::new(text, SourceKind::Documentation).with_metadata("source", url)
    }

    #[inline]
    pub fn readme(text: impl Into<String>) -> Self {
        Self::new(text, SourceKind::GithubReadme).with_metadata("source", "github_readme")
    }

    /// The `index`-th extracted code example
    #[inline]
    pub fn code_example(text: impl Into<String>, index: usize) -> Self {
        Self::new(text, SourceKind::CodeExample)
            .with_metadata("source", format!("example_{index}"))
    }

    #[inline]
    pub fn with_metadata(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A retrieved chunk with its final (possibly boosted) score
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub id: ChunkId,
    pub text: String,
    pub score: f32,
    pub source_kind: SourceKind,
    pub metadata: Metadata,
}

impl From<ScoredChunk> for RetrievedChunk {
    #[inline]
    fn from(chunk: ScoredChunk) -> Self {
        Self {
            id: chunk.id,
            text: chunk.text,
            score: chunk.score,
            source_kind: chunk.source_kind,
            metadata: chunk.metadata,
        }
    }
}

/// Ties chunking, embedding and storage together for one store.
///
/// Indexing chunks and embeds everything before touching the store, so a failure
/// or cancellation during embedding leaves the store as it was.
pub struct ContextManager {
    chunker: Chunker,
    embedder: Embedder,
    store: Arc<dyn VectorStore>,
    retrieval: RetrievalConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for ContextManager {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("chunker", &self.chunker)
            .field("embedder", &self.embedder)
            .field("dimension", &self.store.dimension())
            .field("retrieval", &self.retrieval)
            .finish_non_exhaustive()
    }
}

impl ContextManager {
    #[inline]
    pub fn new(
        chunker: Chunker,
        embedder: Embedder,
        store: Arc<dyn VectorStore>,
        retrieval: RetrievalConfig,
    ) -> Result<Self> {
        retrieval.validate()?;

        if embedder.dimension() != store.dimension() {
            return Err(ContextError::DimensionMismatch {
                expected: store.dimension(),
                actual: embedder.dimension(),
            });
        }

        let estimator = Arc::new(CharRatioEstimator::new(retrieval.chars_per_token));
        Ok(Self {
            chunker,
            embedder,
            store,
            retrieval,
            estimator,
        })
    }

    /// Build the configured backend and open the SQLite store under the base directory
    #[inline]
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let dimension = config.embedding.dimension;
        let backend: Arc<dyn EmbeddingBackend> = match config.embedding.backend {
            BackendKind::Ollama => Arc::new(OllamaBackend::new(&config.ollama, dimension)?),
            BackendKind::Hashing => Arc::new(HashingBackend::new(dimension)),
        };
        let embedder = Embedder::from_config(backend, &config.embedding)?;

        let store_path = config.store_path();
        let store =
            SqliteVectorStore::open(&store_path, dimension, embedder.model_name()).await?;

        info!(
            "Context manager ready: {:?} backend, store at {}",
            config.embedding.backend,
            store_path.display()
        );

        Self::new(
            Chunker::new(config.chunking)?,
            embedder,
            Arc::new(store),
            config.retrieval.clone(),
        )
    }

    #[inline]
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    #[inline]
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Chunk, embed and store documentation and code examples for `library`.
    ///
    /// Returns the number of chunks stored. Indexing appends; call
    /// [`reindex_library`](Self::reindex_library) to replace earlier content.
    #[inline]
    pub async fn index_content(
        &self,
        library: &str,
        documentation: &[SourceDocument],
        code_examples: &[SourceDocument],
    ) -> Result<usize> {
        validate_library(library)?;
        info!("Indexing content for library {}", library);

        let chunks = self
            .prepare_chunks(library, documentation.iter().chain(code_examples))
            .await?;
        if chunks.is_empty() {
            info!("Nothing to index for library {}", library);
            return Ok(0);
        }

        let ids = self.store.insert(chunks).await?;
        info!("Indexed {} chunks for library {}", ids.len(), library);
        Ok(ids.len())
    }

    /// Replace everything stored for `library` with freshly indexed content
    #[inline]
    pub async fn reindex_library(
        &self,
        library: &str,
        documentation: &[SourceDocument],
        code_examples: &[SourceDocument],
    ) -> Result<usize> {
        validate_library(library)?;
        info!("Re-indexing library {}", library);

        let chunks = self
            .prepare_chunks(library, documentation.iter().chain(code_examples))
            .await?;
        let ids = self.store.replace_library(library, chunks).await?;

        info!("Re-indexed library {} with {} chunks", library, ids.len());
        Ok(ids.len())
    }

    #[inline]
    pub async fn delete_library(&self, library: &str) -> Result<u64> {
        let deleted = self.store.delete_by_library(library).await?;
        info!("Deleted {} chunks for library {}", deleted, library);
        Ok(deleted)
    }

    #[inline]
    pub async fn count(&self, library: Option<&str>) -> Result<u64> {
        self.store.count(library).await
    }

    /// Remove every library from the store
    #[inline]
    pub async fn clear(&self) -> Result<u64> {
        let mut deleted = 0;
        for (library, _) in self.store.libraries().await? {
            deleted += self.store.delete_by_library(&library).await?;
        }
        info!("Cleared {} chunks from the store", deleted);
        Ok(deleted)
    }

    /// Texts of the most relevant chunks, best first, within the token budget
    #[inline]
    pub async fn retrieve_relevant_context(
        &self,
        query: &str,
        library: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<String>> {
        let chunks = self.retrieve_scored(query, library, top_k).await?;
        Ok(chunks.into_iter().map(|chunk| chunk.text).collect())
    }

    /// Like [`retrieve_relevant_context`](Self::retrieve_relevant_context), keeping ids,
    /// scores and metadata
    #[inline]
    pub async fn retrieve_scored(
        &self,
        query: &str,
        library: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedChunk>> {
        let top_k = top_k.unwrap_or(self.retrieval.top_k);
        info!("Retrieving context for query: {}", query);

        if top_k == 0 || self.store.count(Some(library)).await? == 0 {
            debug!("Library {} has no indexed content", library);
            return Ok(Vec::new());
        }

        let enriched_query = if self.retrieval.prefix_library {
            format!("{library} {query}")
        } else {
            query.to_string()
        };
        let query_vector = self.embedder.embed_one(&enriched_query).await?;

        let candidates = self
            .store
            .search(
                &query_vector,
                Some(library),
                top_k.saturating_mul(self.retrieval.overfetch_factor),
            )
            .await?;
        let ranked = self.rerank(candidates, query, top_k);

        let mut selected = Vec::with_capacity(ranked.len());
        let mut total_tokens = 0;
        for chunk in ranked {
            let tokens = self.estimator.estimate(&chunk.text);
            if total_tokens + tokens > self.retrieval.max_context_tokens {
                debug!(
                    "Chunk {} ({} tokens) would exceed the budget of {}",
                    chunk.id, tokens, self.retrieval.max_context_tokens
                );
                break;
            }
            total_tokens += tokens;
            selected.push(chunk);
        }

        info!(
            "Retrieved {} context pieces ({} tokens)",
            selected.len(),
            total_tokens
        );
        Ok(selected)
    }

    /// Apply the example boost, restore rank order and cut back to `top_k`
    fn rerank(&self, candidates: Vec<ScoredChunk>, query: &str, top_k: usize) -> Vec<RetrievedChunk> {
        let query_lower = query.to_lowercase();
        let needs_examples = EXAMPLE_KEYWORDS
            .iter()
            .any(|keyword| query_lower.contains(keyword));

        let mut ranked: Vec<RetrievedChunk> = candidates
            .into_iter()
            .map(|candidate| {
                let mut chunk = RetrievedChunk::from(candidate);
                if needs_examples && chunk.source_kind == SourceKind::CodeExample {
                    // Scaled by |score| so negative similarities also move up
                    chunk.score = (self.retrieval.example_boost - 1.0)
                        .mul_add(chunk.score.abs(), chunk.score);
                }
                chunk
            })
            .collect();

        sort_ranked(&mut ranked, |chunk| (chunk.score, chunk.id));
        ranked.truncate(top_k);
        ranked
    }

    /// Chunk every document and embed all chunk texts in one batch
    async fn prepare_chunks<'a, I>(&self, library: &str, documents: I) -> Result<Vec<NewChunk>>
    where
        I: Iterator<Item = &'a SourceDocument>,
    {
        let mut pending: Vec<(&SourceDocument, ChunkSpan)> = Vec::new();
        for document in documents {
            let spans = if document.source_kind.is_code() {
                self.chunker.chunk_code(&document.text)
            } else {
                self.chunker.chunk(&document.text)
            };
            pending.extend(spans.into_iter().map(|span| (document, span)));
        }

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = pending.iter().map(|(_, span)| span.text.clone()).collect();
        debug!(
            "Embedding {} chunks for library {}",
            texts.len(),
            library
        );
        let vectors = self.embedder.embed_batch(&texts).await?;

        Ok(pending
            .into_iter()
            .zip(vectors)
            .map(|((document, span), vector)| {
                let metadata = chunk_metadata(document, &span);
                NewChunk {
                    library: library.to_string(),
                    source_kind: document.source_kind,
                    text: span.text,
                    vector,
                    metadata,
                }
            })
            .collect())
    }
}

/// Document metadata plus the span's position within the document
fn chunk_metadata(document: &SourceDocument, span: &ChunkSpan) -> Metadata {
    let mut metadata = document.metadata.clone();
    metadata.insert("position".to_string(), span.index.into());
    metadata.insert("overlap".to_string(), span.overlap.into());
    metadata.insert("start".to_string(), span.start.into());
    metadata.insert("end".to_string(), span.end.into());
    metadata.insert(
        "source_kind".to_string(),
        document.source_kind.as_str().into(),
    );
    metadata
}
