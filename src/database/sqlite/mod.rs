use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::locks::LibraryLocks;
use super::models::{
    ChunkId, Metadata, NewChunk, ScoredChunk, SourceKind, validate_batch, validate_library,
};
use super::ranking::{TopK, cosine_similarity};
use super::{VectorStore, check_query};
use crate::{ContextError, Result};


pub type DbPool = Pool<Sqlite>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DIMENSION_KEY: &str = "dimension";
const MODEL_KEY: &str = "model";

const SELECT_CHUNKS: &str =
    "SELECT id, library, source_kind, text, vector, metadata, created_at FROM chunks";

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: i64,
    library: String,
    source_kind: String,
    text: String,
    vector: Vec<u8>,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl ChunkRow {
    fn into_scored(self, score: f32) -> Result<ScoredChunk> {
        let metadata: Metadata = serde_json::from_str(&self.metadata).map_err(|e| {
            ContextError::StoreUnavailable(format!("corrupt metadata for chunk {}: {e}", self.id))
        })?;

        Ok(ScoredChunk {
            id: ChunkId(self.id),
            library: self.library,
            source_kind: self.source_kind.parse::<SourceKind>()?,
            text: self.text,
            metadata,
            created_at: self.created_at,
            score,
        })
    }
}

/// Encode a vector as little-endian `f32`s
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8], dimension: usize) -> Result<Vec<f32>> {
    let chunks = bytes.chunks_exact(4);
    if !chunks.remainder().is_empty() || chunks.len() != dimension {
        return Err(ContextError::StoreUnavailable(format!(
            "corrupt vector blob of {} bytes (expected {} floats)",
            bytes.len(),
            dimension
        )));
    }

    Ok(chunks
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Vector store persisted in a single SQLite database file.
///
/// The database remembers the dimension it was created with; opening it with a
/// different one fails instead of mixing vector spaces. Every write runs in one
/// transaction, so a failed or cancelled write leaves no trace.
#[derive(Debug)]
pub struct SqliteVectorStore {
    pool: DbPool,
    dimension: usize,
    model: String,
    locks: LibraryLocks,
}

impl SqliteVectorStore {
    /// Open or create the store at `path` for vectors of `dimension` produced by `model`
    #[inline]
    pub async fn open<P: AsRef<Path>>(path: P, dimension: usize, model: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            dimension,
            model: model.to_string(),
            locks: LibraryLocks::new(),
        };
        store.run_migrations().await?;
        store.check_store_meta().await?;

        info!(
            "Opened vector store at {} (dimension {}, model {})",
            path.display(),
            dimension,
            model
        );
        Ok(store)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Embedding model the store was opened with
    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        debug!("Running vector store migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await?;

        debug!("Vector store migrations completed successfully");
        Ok(())
    }

    /// Record dimension and model on first open; verify them on every later one
    async fn check_store_meta(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO store_meta (key, value) VALUES (?, ?), (?, ?)")
            .bind(DIMENSION_KEY)
            .bind(self.dimension.to_string())
            .bind(MODEL_KEY)
            .bind(&self.model)
            .execute(&mut *tx)
            .await?;

        let stored: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM store_meta")
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        for (key, value) in stored {
            match key.as_str() {
                DIMENSION_KEY => {
                    let stored_dimension: usize = value.parse().map_err(|_| {
                        ContextError::StoreUnavailable(format!("corrupt stored dimension '{value}'"))
                    })?;
                    if stored_dimension != self.dimension {
                        return Err(ContextError::DimensionMismatch {
                            expected: stored_dimension,
                            actual: self.dimension,
                        });
                    }
                }
                MODEL_KEY if value != self.model => {
                    warn!(
                        "Vector store was built with model {} but is opened with {}",
                        value, self.model
                    );
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn insert_rows(
        tx: &mut Transaction<'_, Sqlite>,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkId>> {
        let created_at = Utc::now();
        let mut ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let metadata = serde_json::to_string(&chunk.metadata)
                .map_err(|e| ContextError::InvalidChunk(format!("unserializable metadata: {e}")))?;

            let id = sqlx::query(
                "INSERT INTO chunks (library, source_kind, text, vector, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.library)
            .bind(chunk.source_kind.as_str())
            .bind(&chunk.text)
            .bind(encode_vector(&chunk.vector))
            .bind(metadata)
            .bind(created_at)
            .execute(&mut **tx)
            .await?
            .last_insert_rowid();

            ids.push(ChunkId(id));
        }

        Ok(ids)
    }

    /// Reclaim space and refresh query planner statistics
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing vector store");

        sqlx::query("VACUUM").execute(&self.pool).await?;
        sqlx::query("ANALYZE").execute(&self.pool).await?;

        debug!("Vector store optimization completed");
        Ok(())
    }

    #[inline]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    async fn insert(&self, chunks: Vec<NewChunk>) -> Result<Vec<ChunkId>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        validate_batch(&chunks, self.dimension)?;

        let _write_lock = self
            .locks
            .lock_many(chunks.iter().map(|c| c.library.as_str()))
            .await;

        let mut tx = self.pool.begin().await?;
        let ids = Self::insert_rows(&mut tx, chunks).await?;
        tx.commit().await?;

        debug!("Inserted {} chunks", ids.len());
        Ok(ids)
    }

    #[inline]
    async fn search(
        &self,
        query: &[f32],
        library: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        check_query(query, self.dimension)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let by_library = format!("{SELECT_CHUNKS} WHERE library = ? ORDER BY id");
        let everything = format!("{SELECT_CHUNKS} ORDER BY id");
        let mut rows = match library {
            Some(library) => sqlx::query_as::<_, ChunkRow>(&by_library)
                .bind(library)
                .fetch(&self.pool),
            None => sqlx::query_as::<_, ChunkRow>(&everything).fetch(&self.pool),
        };

        let mut top = TopK::new(top_k);
        let mut scanned = 0_usize;
        while let Some(row) = rows.try_next().await? {
            let vector = decode_vector(&row.vector, self.dimension)?;
            let score = cosine_similarity(query, &vector);
            top.push(score, ChunkId(row.id), row);
            scanned += 1;
        }
        drop(rows);

        let results = top
            .into_sorted()
            .into_iter()
            .map(|(score, row)| row.into_scored(score))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Scanned {} chunks, returning {} results",
            scanned,
            results.len()
        );
        Ok(results)
    }

    #[inline]
    async fn delete_by_library(&self, library: &str) -> Result<u64> {
        let write_lock = self.locks.lock(library).await;

        let deleted = sqlx::query("DELETE FROM chunks WHERE library = ?")
            .bind(library)
            .execute(&self.pool)
            .await?
            .rows_affected();
        drop(write_lock);
        self.locks.prune();

        debug!("Deleted {} chunks for library {}", deleted, library);
        Ok(deleted)
    }

    #[inline]
    async fn count(&self, library: Option<&str>) -> Result<u64> {
        let count: i64 = match library {
            Some(library) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE library = ?")
                    .bind(library)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok(count.unsigned_abs())
    }

    #[inline]
    async fn replace_library(&self, library: &str, chunks: Vec<NewChunk>) -> Result<Vec<ChunkId>> {
        validate_library(library)?;
        if let Some(stray) = chunks.iter().find(|c| c.library != library) {
            return Err(ContextError::InvalidChunk(format!(
                "chunk for library '{}' in replacement of '{}'",
                stray.library, library
            )));
        }
        validate_batch(&chunks, self.dimension)?;

        let _write_lock = self.locks.lock(library).await;

        let mut tx = self.pool.begin().await?;
        let replaced = sqlx::query("DELETE FROM chunks WHERE library = ?")
            .bind(library)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let ids = Self::insert_rows(&mut tx, chunks).await?;
        tx.commit().await?;

        debug!(
            "Replaced {} chunks with {} for library {}",
            replaced,
            ids.len(),
            library
        );
        Ok(ids)
    }

    #[inline]
    async fn libraries(&self) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT library, COUNT(*) FROM chunks GROUP BY library ORDER BY library",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(library, count)| (library, count.unsigned_abs()))
            .collect())
    }
}
