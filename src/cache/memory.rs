//! In-process cache backend

use super::{CacheBackend, CacheEntry, CacheError, CacheSummary};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Cache entries held in memory for the lifetime of the process
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Task("memory cache lock poisoned".into())
}

impl CacheBackend for MemoryCache {
    fn load(&self, key: &str) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        // Readers holding the old Arc keep a consistent snapshot
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(entry.key.clone(), Arc::new(entry));
        Ok(())
    }

    fn list(&self) -> Result<Vec<CacheSummary>, CacheError> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut summaries: Vec<_> = entries.values().map(|e| e.summary()).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }
}
