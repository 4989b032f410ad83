
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use super::locks::LibraryLocks;
use super::models::{
    ChunkId, NewChunk, ScoredChunk, StoredChunk, validate_batch, validate_library,
};
use super::ranking::{TopK, cosine_similarity};
use super::{VectorStore, check_query};
use crate::{ContextError, Result};

/// Records of one library, kept in ascending id order
type Partition = Arc<RwLock<Vec<StoredChunk>>>;

/// In-process vector store.
///
/// Each library lives in its own contiguous arena behind a read/write lock, so a
/// search only scans the partitions it needs and never observes half of a write.
/// Nothing is persisted.
#[derive(Debug)]
pub struct MemoryVectorStore {
    dimension: usize,
    partitions: RwLock<BTreeMap<String, Partition>>,
    next_id: AtomicI64,
    locks: LibraryLocks,
}

impl MemoryVectorStore {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            partitions: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            locks: LibraryLocks::new(),
        }
    }

    /// Existing partitions for `libraries`, creating the missing ones
    async fn ensure_partitions(&self, libraries: &BTreeSet<&str>) -> Vec<(String, Partition)> {
        let mut partitions = self.partitions.write().await;
        libraries
            .iter()
            .map(|&library| {
                let partition = partitions.entry(library.to_string()).or_default();
                (library.to_string(), Arc::clone(partition))
            })
            .collect()
    }

    /// Partitions a search or count should look at, in name order
    async fn snapshot(&self, library: Option<&str>) -> Vec<Partition> {
        let partitions = self.partitions.read().await;
        match library {
            Some(library) => partitions.get(library).into_iter().cloned().collect(),
            None => partitions.values().cloned().collect(),
        }
    }

    fn allocate_id(&self) -> ChunkId {
        ChunkId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Assign ids in input order and append each chunk to its locked partition
    fn append(
        &self,
        chunks: Vec<NewChunk>,
        guards: &mut BTreeMap<String, OwnedRwLockWriteGuard<Vec<StoredChunk>>>,
    ) -> Result<Vec<ChunkId>> {
        let created_at = Utc::now();
        let mut ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let partition = guards.get_mut(&chunk.library).ok_or_else(|| {
                ContextError::StoreUnavailable(format!(
                    "partition for library '{}' is not locked",
                    chunk.library
                ))
            })?;
            let id = self.allocate_id();
            partition.push(StoredChunk::from_new(id, chunk, created_at));
            ids.push(id);
        }

        Ok(ids)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
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

        let libraries: BTreeSet<&str> = chunks.iter().map(|c| c.library.as_str()).collect();
        let _write_lock = self.locks.lock_many(libraries.iter().copied()).await;

        let mut guards = BTreeMap::new();
        for (library, partition) in self.ensure_partitions(&libraries).await {
            guards.insert(library, partition.write_owned().await);
        }

        let ids = self.append(chunks, &mut guards)?;
        debug!(
            "Inserted {} chunks into {} libraries",
            ids.len(),
            guards.len()
        );
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

        let partitions = self.snapshot(library).await;
        let mut guards = Vec::with_capacity(partitions.len());
        for partition in partitions {
            guards.push(partition.read_owned().await);
        }

        let mut top = TopK::new(top_k);
        let mut scanned = 0_usize;
        for chunk in guards.iter().flat_map(|guard| guard.iter()) {
            let score = cosine_similarity(query, &chunk.vector);
            top.push(score, chunk.id, chunk);
            scanned += 1;
        }

        let results: Vec<ScoredChunk> = top
            .into_sorted()
            .into_iter()
            .map(|(score, chunk)| ScoredChunk::from_stored(chunk, score))
            .collect();

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

        let removed = self.partitions.write().await.remove(library);
        let deleted = match removed {
            Some(partition) => {
                let mut records = partition.write().await;
                let deleted = records.len() as u64;
                records.clear();
                deleted
            }
            None => 0,
        };
        drop(write_lock);
        self.locks.prune();

        debug!("Deleted {} chunks for library {}", deleted, library);
        Ok(deleted)
    }

    #[inline]
    async fn count(&self, library: Option<&str>) -> Result<u64> {
        let mut total = 0_u64;
        for partition in self.snapshot(library).await {
            total += partition.read().await.len() as u64;
        }
        Ok(total)
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

        let libraries = BTreeSet::from([library]);
        let mut guards = BTreeMap::new();
        for (name, partition) in self.ensure_partitions(&libraries).await {
            guards.insert(name, partition.write_owned().await);
        }

        let replaced = guards.get_mut(library).map_or(0, |records| {
            let count = records.len();
            records.clear();
            count
        });
        let ids = self.append(chunks, &mut guards)?;

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
        let partitions: Vec<(String, Partition)> = self
            .partitions
            .read()
            .await
            .iter()
            .map(|(name, partition)| (name.clone(), Arc::clone(partition)))
            .collect();

        let mut libraries = Vec::with_capacity(partitions.len());
        for (name, partition) in partitions {
            let count = partition.read().await.len() as u64;
            if count > 0 {
                libraries.push((name, count));
            }
        }
        Ok(libraries)
    }
}
