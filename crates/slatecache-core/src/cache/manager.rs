use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use super::{CacheEntry, EntryMeta, KeyLocks, LocalStore, ScanFilter, StoreError};
use crate::models::{CacheKey, EntityKind};

/// How a payload reached the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveMode {
    /// Local edit not yet confirmed by the server: marks dirty, keeps version
    Local { scope: Option<String> },
    /// Server-confirmed content: clears dirty, stamps `cached_at`
    Confirmed { version: u64, scope: Option<String> },
}

impl SaveMode {
    fn scope(&self) -> Option<&String> {
        match self {
            SaveMode::Local { scope } | SaveMode::Confirmed { scope, .. } => scope.as_ref(),
        }
    }
}

/// Result of writing server content over whatever the cache holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteThrough {
    Stored(EntryMeta),
    /// The cache holds unsynced local work, which wins over the fetch
    KeptDirty(CacheEntry),
}

/// Result of applying a server acknowledgment to a synced entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The acknowledged revision was current; entry is clean
    Clean,
    /// A newer local edit landed meanwhile; version advanced, entry stays dirty
    Superseded,
    /// Entry was deleted while the sync was in flight
    Missing,
}

/// Result of a conditional removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// Holds unsynced local work and was left in place
    KeptDirty,
    /// Nothing stored under the key
    Absent,
}

/// Shared local content store.
///
/// All cache access goes through this type. Mutations of one key are
/// serialized by a per-key write lock; a second per-key lock lets the
/// sync path keep one upstream write in flight per key.
pub struct CacheStore {
    backend: Arc<dyn LocalStore>,
    write_locks: KeyLocks,
    sync_locks: KeyLocks,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn LocalStore>) -> Self {
        Self {
            backend,
            write_locks: KeyLocks::new(),
            sync_locks: KeyLocks::new(),
        }
    }

    /// Read an entry, counting the access.
    ///
    /// A corrupt entry is invalidated and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let mut entry = match self.peek(key).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if let Some(meta) = self.backend.record_hit(key, Utc::now()).await? {
            entry.meta.hit_count = meta.hit_count;
            entry.meta.last_accessed_at = meta.last_accessed_at;
        }
        Ok(Some(entry))
    }

    /// Read an entry without touching access statistics
    pub async fn peek(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        match self.backend.load(key).await {
            Ok(entry) => Ok(entry),
            Err(StoreError::Corrupt(_)) => {
                warn!(key = %key, "Corrupt cache entry, invalidating");
                self.delete(key).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn meta(&self, key: &CacheKey) -> Result<Option<EntryMeta>, StoreError> {
        self.backend.load_meta(key).await
    }

    /// Upsert a payload. Replaces any existing entry for the key in place.
    pub async fn save(
        &self,
        key: &CacheKey,
        payload: Vec<u8>,
        mode: SaveMode,
    ) -> Result<EntryMeta, StoreError> {
        let _guard = self.write_locks.lock(key).await;
        self.save_locked(key, payload, mode).await
    }

    async fn save_locked(
        &self,
        key: &CacheKey,
        payload: Vec<u8>,
        mode: SaveMode,
    ) -> Result<EntryMeta, StoreError> {
        let now = Utc::now();
        let existing = self.backend.load_meta(key).await?;

        let scope = mode
            .scope()
            .cloned()
            .or_else(|| existing.as_ref().and_then(|m| m.scope.clone()));
        let (hit_count, last_accessed_at) = existing
            .as_ref()
            .map(|m| (m.hit_count, m.last_accessed_at))
            .unwrap_or((0, now));
        let previous_revision = existing.as_ref().map(|m| m.revision).unwrap_or(0);

        let meta = match mode {
            SaveMode::Local { .. } => EntryMeta {
                key: key.clone(),
                scope,
                size_bytes: payload.len() as u64,
                // Local writes do not claim server freshness
                cached_at: existing.as_ref().and_then(|m| m.cached_at),
                last_accessed_at,
                hit_count,
                is_dirty: true,
                version: existing.as_ref().map(|m| m.version).unwrap_or(0),
                revision: previous_revision + 1,
            },
            SaveMode::Confirmed { version, .. } => EntryMeta {
                key: key.clone(),
                scope,
                size_bytes: payload.len() as u64,
                cached_at: Some(now),
                last_accessed_at,
                hit_count,
                is_dirty: false,
                version,
                revision: previous_revision,
            },
        };

        self.backend
            .upsert(&CacheEntry {
                meta: meta.clone(),
                payload,
            })
            .await?;
        debug!(key = %key, dirty = meta.is_dirty, size = meta.size_bytes, "Cache entry saved");
        Ok(meta)
    }

    /// Store fetched server content unless the entry holds unsynced work
    pub async fn write_through(
        &self,
        key: &CacheKey,
        payload: Vec<u8>,
        version: u64,
        scope: Option<String>,
    ) -> Result<WriteThrough, StoreError> {
        let _guard = self.write_locks.lock(key).await;

        if let Some(meta) = self.backend.load_meta(key).await? {
            if meta.is_dirty {
                match self.backend.load(key).await {
                    Ok(Some(entry)) => {
                        debug!(key = %key, "Keeping dirty entry over fetched content");
                        return Ok(WriteThrough::KeptDirty(entry));
                    }
                    Ok(None) => {}
                    Err(StoreError::Corrupt(_)) => {
                        warn!(key = %key, "Dirty entry is corrupt, replacing with server content");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let meta = self
            .save_locked(key, payload, SaveMode::Confirmed { version, scope })
            .await?;
        Ok(WriteThrough::Stored(meta))
    }

    /// Apply a server acknowledgment for the local revision that was submitted
    pub async fn confirm(
        &self,
        key: &CacheKey,
        submitted_revision: u64,
        payload: Vec<u8>,
        version: u64,
    ) -> Result<Confirmation, StoreError> {
        let _guard = self.write_locks.lock(key).await;

        let mut meta = match self.backend.load_meta(key).await? {
            Some(meta) => meta,
            None => return Ok(Confirmation::Missing),
        };

        if meta.revision == submitted_revision {
            self.save_locked(key, payload, SaveMode::Confirmed { version, scope: None })
                .await?;
            return Ok(Confirmation::Clean);
        }

        debug!(
            key = %key,
            submitted_revision,
            current_revision = meta.revision,
            "Newer local edit arrived during sync"
        );
        meta.version = version;
        self.backend.update_meta(&meta).await?;
        Ok(Confirmation::Superseded)
    }

    /// Idempotent removal
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let _guard = self.write_locks.lock(key).await;
        self.backend.remove(key).await
    }

    /// Remove the entry only if it is clean at the moment of deletion
    pub async fn remove_if_clean(&self, key: &CacheKey) -> Result<Removal, StoreError> {
        let _guard = self.write_locks.lock(key).await;
        match self.backend.load_meta(key).await? {
            Some(meta) if meta.is_dirty => Ok(Removal::KeptDirty),
            Some(_) => {
                self.backend.remove(key).await?;
                Ok(Removal::Removed)
            }
            None => Ok(Removal::Absent),
        }
    }

    /// Held by the sync path for the whole upstream write of one key
    pub async fn lock_for_sync(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        self.sync_locks.lock(key).await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush().await
    }

    pub async fn scan(&self, filter: &ScanFilter) -> Result<Vec<EntryMeta>, StoreError> {
        self.backend.scan(filter).await
    }

    pub async fn size_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.scan(&ScanFilter::all()).await?.iter().map(|m| m.size_bytes).sum())
    }

    pub async fn size_of(&self, kind: EntityKind) -> Result<u64, StoreError> {
        Ok(self
            .scan(&ScanFilter::all().with_kind(kind))
            .await?
            .iter()
            .map(|m| m.size_bytes)
            .sum())
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.scan(&ScanFilter::all()).await?.len())
    }

    pub async fn list_dirty(&self, scope: Option<&str>) -> Result<Vec<EntryMeta>, StoreError> {
        let mut filter = ScanFilter::dirty();
        if let Some(scope) = scope {
            filter = filter.with_scope(scope);
        }
        let mut dirty = self.scan(&filter).await?;
        dirty.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn store() -> CacheStore {
        CacheStore::new(Arc::new(MemoryStore::new()))
    }

    fn local(scope: &str) -> SaveMode {
        SaveMode::Local {
            scope: Some(scope.to_string()),
        }
    }

    fn confirmed(version: u64) -> SaveMode {
        SaveMode::Confirmed {
            version,
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_get_counts_hits_and_peek_does_not() {
        let store = store();
        let key = CacheKey::event("1");
        store.save(&key, b"abc".to_vec(), confirmed(1)).await.unwrap();

        store.get(&key).await.unwrap();
        let entry = store.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.meta.hit_count, 2);
        assert_eq!(entry.payload, b"abc");

        store.peek(&key).await.unwrap();
        assert_eq!(store.meta(&key).await.unwrap().unwrap().hit_count, 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let store = store();
        let key = CacheKey::note("5");
        store.save(&key, b"first".to_vec(), local("b1")).await.unwrap();
        store.save(&key, b"second!".to_vec(), local("b1")).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.size_bytes().await.unwrap(), 7);
        let entry = store.peek(&key).await.unwrap().unwrap();
        assert_eq!(entry.payload, b"second!");
        assert_eq!(entry.meta.revision, 2);
    }

    #[tokio::test]
    async fn test_local_save_keeps_version_and_freshness() {
        let store = store();
        let key = CacheKey::note("5");
        let clean = store.save(&key, b"a".to_vec(), confirmed(4)).await.unwrap();
        let dirty = store.save(&key, b"b".to_vec(), local("b1")).await.unwrap();

        assert!(dirty.is_dirty);
        assert_eq!(dirty.version, 4);
        assert_eq!(dirty.cached_at, clean.cached_at);
        assert_eq!(dirty.scope.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn test_first_local_save_has_no_cached_at() {
        let store = store();
        let meta = store
            .save(&CacheKey::note("1"), b"x".to_vec(), local("b1"))
            .await
            .unwrap();
        assert!(meta.cached_at.is_none());
        assert_eq!(meta.version, 0);
    }

    #[tokio::test]
    async fn test_write_through_keeps_dirty_entry() {
        let store = store();
        let key = CacheKey::note("1");
        store.save(&key, b"mine".to_vec(), local("b1")).await.unwrap();

        let result = store
            .write_through(&key, b"theirs".to_vec(), 9, None)
            .await
            .unwrap();
        match result {
            WriteThrough::KeptDirty(entry) => assert_eq!(entry.payload, b"mine"),
            other => panic!("expected dirty entry to win, got {:?}", other),
        }
        assert_eq!(store.meta(&key).await.unwrap().unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_confirm_clears_dirty_for_current_revision() {
        let store = store();
        let key = CacheKey::note("1");
        let meta = store.save(&key, b"v".to_vec(), local("b1")).await.unwrap();

        let outcome = store
            .confirm(&key, meta.revision, b"v".to_vec(), 1)
            .await
            .unwrap();
        assert_eq!(outcome, Confirmation::Clean);

        let meta = store.meta(&key).await.unwrap().unwrap();
        assert!(!meta.is_dirty);
        assert_eq!(meta.version, 1);
        assert!(meta.cached_at.is_some());
        assert_eq!(meta.scope.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn test_confirm_with_stale_revision_keeps_newer_edit() {
        let store = store();
        let key = CacheKey::note("1");
        let first = store.save(&key, b"one".to_vec(), local("b1")).await.unwrap();
        store.save(&key, b"two".to_vec(), local("b1")).await.unwrap();

        let outcome = store
            .confirm(&key, first.revision, b"one".to_vec(), 3)
            .await
            .unwrap();
        assert_eq!(outcome, Confirmation::Superseded);

        let entry = store.peek(&key).await.unwrap().unwrap();
        assert!(entry.meta.is_dirty);
        assert_eq!(entry.meta.version, 3);
        assert_eq!(entry.payload, b"two");
    }

    #[tokio::test]
    async fn test_confirm_after_delete_reports_missing() {
        let store = store();
        let key = CacheKey::note("1");
        store.save(&key, b"x".to_vec(), local("b1")).await.unwrap();
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert_eq!(
            store.confirm(&key, 1, b"x".to_vec(), 1).await.unwrap(),
            Confirmation::Missing
        );
    }

    #[tokio::test]
    async fn test_remove_if_clean_refuses_dirty() {
        let store = store();
        let dirty = CacheKey::note("d");
        let clean = CacheKey::note("c");
        store.save(&dirty, b"x".to_vec(), local("b1")).await.unwrap();
        store.save(&clean, b"y".to_vec(), confirmed(1)).await.unwrap();

        assert_eq!(store.remove_if_clean(&dirty).await.unwrap(), Removal::KeptDirty);
        assert_eq!(store.remove_if_clean(&clean).await.unwrap(), Removal::Removed);
        assert_eq!(store.remove_if_clean(&clean).await.unwrap(), Removal::Absent);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_dirty_by_scope_and_size_by_kind() {
        let store = store();
        store.save(&CacheKey::note("1"), b"aa".to_vec(), local("b1")).await.unwrap();
        store.save(&CacheKey::note("2"), b"bbb".to_vec(), local("b2")).await.unwrap();
        store.save(&CacheKey::event("3"), b"c".to_vec(), confirmed(1)).await.unwrap();

        assert_eq!(store.list_dirty(None).await.unwrap().len(), 2);
        let scoped = store.list_dirty(Some("b2")).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].key, CacheKey::note("2"));

        assert_eq!(store.size_of(EntityKind::Note).await.unwrap(), 5);
        assert_eq!(store.size_of(EntityKind::Drawing).await.unwrap(), 0);
    }
}
