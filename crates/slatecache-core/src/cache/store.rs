use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{CacheEntry, EntryMeta};
use crate::models::{CacheKey, EntityKind};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(CacheKey),
}

/// Metadata query used for size aggregation, eviction and scoped sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub kind: Option<EntityKind>,
    pub scope: Option<String>,
    pub dirty: Option<bool>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn dirty() -> Self {
        Self {
            dirty: Some(true),
            ..Self::default()
        }
    }

    pub fn clean() -> Self {
        Self {
            dirty: Some(false),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn matches(&self, meta: &EntryMeta) -> bool {
        if let Some(kind) = self.kind {
            if meta.key.kind != kind {
                return false;
            }
        }
        if let Some(ref scope) = self.scope {
            if meta.scope.as_ref() != Some(scope) {
                return false;
            }
        }
        if let Some(dirty) = self.dirty {
            if meta.is_dirty != dirty {
                return false;
            }
        }
        true
    }
}

/// Durable key-value storage behind the cache.
///
/// Every call is atomic with respect to other calls on the same store.
/// Access statistics (`hit_count`, `last_accessed_at`) belong to the
/// backend: `upsert` and `update_meta` keep the stored values for an
/// existing key and only `record_hit` changes them. `record_hit` may be
/// kept in memory until the next mutation or `flush`.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    async fn load_meta(&self, key: &CacheKey) -> Result<Option<EntryMeta>, StoreError>;

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Replace metadata of an existing entry; returns false if absent
    async fn update_meta(&self, meta: &EntryMeta) -> Result<bool, StoreError>;

    async fn record_hit(
        &self,
        key: &CacheKey,
        at: DateTime<Utc>,
    ) -> Result<Option<EntryMeta>, StoreError>;

    /// Returns whether an entry was removed
    async fn remove(&self, key: &CacheKey) -> Result<bool, StoreError>;

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<EntryMeta>, StoreError>;

    /// Persist state held only in memory
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Carry backend-owned access statistics over to an incoming meta
pub(crate) fn keep_access_stats(incoming: &EntryMeta, existing: Option<&EntryMeta>) -> EntryMeta {
    let mut meta = incoming.clone();
    if let Some(existing) = existing {
        meta.hit_count = existing.hit_count;
        meta.last_accessed_at = existing.last_accessed_at;
    }
    meta
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn load_meta(&self, key: &CacheKey) -> Result<Option<EntryMeta>, StoreError> {
        Ok(self.entries().get(key).map(|e| e.meta.clone()))
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let mut entries = self.entries();
        let meta = keep_access_stats(&entry.meta, entries.get(&entry.meta.key).map(|e| &e.meta));
        entries.insert(
            meta.key.clone(),
            CacheEntry {
                meta,
                payload: entry.payload.clone(),
            },
        );
        Ok(())
    }

    async fn update_meta(&self, meta: &EntryMeta) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        match entries.get_mut(&meta.key) {
            Some(entry) => {
                entry.meta = keep_access_stats(meta, Some(&entry.meta));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_hit(
        &self,
        key: &CacheKey,
        at: DateTime<Utc>,
    ) -> Result<Option<EntryMeta>, StoreError> {
        let mut entries = self.entries();
        Ok(entries.get_mut(key).map(|entry| {
            entry.meta.hit_count += 1;
            entry.meta.last_accessed_at = at;
            entry.meta.clone()
        }))
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self.entries().remove(key).is_some())
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<EntryMeta>, StoreError> {
        Ok(self
            .entries()
            .values()
            .filter(|e| filter.matches(&e.meta))
            .map(|e| e.meta.clone())
            .collect())
    }
}
