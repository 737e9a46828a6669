//! Fingerprint-keyed cache shared by job runs
//!
//! This module handles:
//! - Cache entries (path -> bytes blob sets)
//! - Pluggable backends (in-memory, SQLite)
//! - Fingerprints over lock files and an architecture tag
//! - Collecting blobs from and restoring them into a working directory
//!
//! Cache failures never fail a job: `CacheStore` logs them and behaves as a miss.

mod archive;
mod fingerprint;
mod memory;
mod sqlite;

pub use archive::{collect_blobs, restore_blobs};
pub use fingerprint::fingerprint;
pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Stored files, keyed by path relative to the job directory
pub type Blobs = BTreeMap<PathBuf, Blob>;

/// Mode given to files cached without one
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// One cached filesystem object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blob {
    /// Regular file with its Unix permission bits
    File { content: Vec<u8>, mode: u32 },
    /// Symbolic link, stored as its target rather than followed
    Symlink { target: PathBuf },
}

impl Blob {
    /// Regular file with the default mode
    pub fn file(content: impl Into<Vec<u8>>) -> Self {
        Blob::File {
            content: content.into(),
            mode: DEFAULT_FILE_MODE,
        }
    }

    /// Stored bytes (link targets count as their path length)
    pub fn len(&self) -> u64 {
        match self {
            Blob::File { content, .. } => content.len() as u64,
            Blob::Symlink { target } => target.as_os_str().len() as u64,
        }
    }
}

/// Errors from a cache backend
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cache task failed: {0}")]
    Task(String),

    #[error("invalid cached path: {0}")]
    InvalidPath(String),
}

/// One cached blob set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub blobs: Blobs,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, blobs: Blobs) -> Self {
        Self {
            key: key.into(),
            blobs,
            created_at: Utc::now(),
        }
    }

    /// Total stored bytes
    pub fn size(&self) -> u64 {
        self.blobs.values().map(Blob::len).sum()
    }

    pub fn summary(&self) -> CacheSummary {
        CacheSummary {
            key: self.key.clone(),
            files: self.blobs.len(),
            bytes: self.size(),
            created_at: self.created_at,
        }
    }
}

/// Listing view of a cache entry
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheSummary {
    pub key: String,
    pub files: usize,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Storage behind a `CacheStore`
///
/// Entries are immutable once stored; `store` replaces the whole entry.
pub trait CacheBackend: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Arc<CacheEntry>>, CacheError>;
    fn store(&self, entry: CacheEntry) -> Result<(), CacheError>;
    fn list(&self) -> Result<Vec<CacheSummary>, CacheError>;
    fn clear(&self) -> Result<usize, CacheError>;
}

/// Cache front-end used by job executors
///
/// Writes to one key are serialized; reads take no key lock.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    key_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    verbose: bool,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            verbose: false,
        }
    }

    /// In-process cache, discarded with the store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    /// Log backend failures as warnings instead of debug
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn report(&self, op: &str, key: &str, err: &CacheError) {
        if self.verbose {
            tracing::warn!(op, key, error = %err, "Cache unavailable, continuing without it");
        } else {
            tracing::debug!(op, key, error = %err, "Cache unavailable, continuing without it");
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        match self.key_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks().entry(key.to_string()).or_default().clone()
    }

    /// Drop the key's lock once no other writer holds or waits on it
    fn release_key_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks();
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Look up an entry; misses and backend failures both yield `None`
    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let backend = self.backend.clone();
        let owned_key = key.to_string();
        let result = tokio::task::spawn_blocking(move || backend.load(&owned_key))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(Some(entry)) => {
                tracing::debug!(key, files = entry.blobs.len(), "Cache hit");
                Some(entry)
            }
            Ok(None) => {
                tracing::debug!(key, "Cache miss");
                None
            }
            Err(e) => {
                self.report("get", key, &e);
                None
            }
        }
    }

    /// Store `blobs` under `key`, replacing any previous entry
    ///
    /// Returns whether the backend was written. Identical content is not rewritten.
    pub async fn put(&self, key: &str, blobs: Blobs) -> bool {
        let lock = self.key_lock(key);
        let written = {
            let _guard = lock.lock().await;
            self.write(key, blobs).await
        };
        self.release_key_lock(key, lock);
        written
    }

    async fn write(&self, key: &str, blobs: Blobs) -> bool {
        if let Some(existing) = self.get(key).await {
            if existing.blobs == blobs {
                tracing::debug!(key, "Cache entry unchanged");
                return false;
            }
        }

        let backend = self.backend.clone();
        let entry = CacheEntry::new(key, blobs);
        let result = tokio::task::spawn_blocking(move || backend.store(entry))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => {
                tracing::info!(key, "Saved cache entry");
                true
            }
            Err(e) => {
                self.report("put", key, &e);
                false
            }
        }
    }

    pub fn list(&self) -> Result<Vec<CacheSummary>, CacheError> {
        self.backend.list()
    }

    pub fn clear(&self) -> Result<usize, CacheError> {
        self.backend.clear()
    }
}
