
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per library, created on first use.
///
/// Writers to the same library queue behind each other while writers to other
/// libraries proceed. Readers never take these locks.
#[derive(Debug, Default)]
pub struct LibraryLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that the caller holds the write lock for a set of libraries
#[derive(Debug)]
pub struct LibraryGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LibraryLocks {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, library: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(library.to_string()).or_default())
    }

    /// Lock a single library for writing
    #[inline]
    pub async fn lock(&self, library: &str) -> LibraryGuard {
        let guard = self.handle(library).lock_owned().await;
        LibraryGuard {
            _guards: vec![guard],
        }
    }

    /// Forget locks nobody holds or waits on, e.g. after a library is deleted
    #[inline]
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, handle| Arc::strong_count(handle) > 1);
    }

    /// Number of libraries with a lock entry
    #[inline]
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Lock several libraries, always in sorted order so concurrent batches cannot deadlock
    #[inline]
    pub async fn lock_many<'a, I>(&self, libraries: I) -> LibraryGuard
    where
        I: IntoIterator<Item = &'a str>,
    {
        let handles: Vec<Arc<AsyncMutex<()>>> = libraries
            .into_iter()
            .sorted_unstable()
            .dedup()
            .map(|library| self.handle(library))
            .collect();

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }

        LibraryGuard { _guards: guards }
    }
}
