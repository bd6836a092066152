use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::api::RemoteRecord;
use crate::cache::{CacheStore, Confirmation, EntryMeta, SaveMode, StoreError};
use crate::models::CacheKey;

/// The most recent failed upstream write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub key: CacheKey,
    pub reason: String,
    pub at: DateTime<Utc>,
    /// Failed on a repeated version conflict rather than the network
    pub conflict: bool,
}

/// Queryable sync health, separate from the save path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub dirty_count: usize,
    pub last_failure: Option<SyncFailure>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SyncHistory {
    last_failure: Option<SyncFailure>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Dirty-flag bookkeeping over [`CacheStore`].
///
/// Entries become dirty on local save, before any network attempt, and
/// only a server acknowledgment makes them clean again.
pub struct DirtyTracker {
    store: Arc<CacheStore>,
    history: Mutex<SyncHistory>,
}

impl DirtyTracker {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            history: Mutex::new(SyncHistory::default()),
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, SyncHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn mark_dirty(
        &self,
        key: &CacheKey,
        payload: Vec<u8>,
        scope: Option<String>,
    ) -> Result<EntryMeta, StoreError> {
        self.store.save(key, payload, SaveMode::Local { scope }).await
    }

    pub async fn is_dirty(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self
            .store
            .meta(key)
            .await?
            .map(|m| m.is_dirty)
            .unwrap_or(false))
    }

    pub async fn list_dirty(&self, scope: Option<&str>) -> Result<Vec<EntryMeta>, StoreError> {
        self.store.list_dirty(scope).await
    }

    /// Apply a server acknowledgment for the revision that was submitted
    pub async fn clear_on_ack(
        &self,
        key: &CacheKey,
        submitted_revision: u64,
        ack: &RemoteRecord,
    ) -> Result<Confirmation, StoreError> {
        let confirmation = self
            .store
            .confirm(key, submitted_revision, ack.payload.clone(), ack.version)
            .await?;
        self.history().last_success_at = Some(Utc::now());
        Ok(confirmation)
    }

    /// Remember a failed attempt. The entry stays dirty.
    pub fn record_failure(&self, key: &CacheKey, reason: impl Display, conflict: bool) {
        let reason = reason.to_string();
        warn!(key = %key, reason = %reason, conflict, "Sync failed, keeping local changes");
        self.history().last_failure = Some(SyncFailure {
            key: key.clone(),
            reason,
            at: Utc::now(),
            conflict,
        });
    }

    pub async fn status(&self) -> Result<SyncStatus, StoreError> {
        let dirty_count = self.store.list_dirty(None).await?.len();
        let history = self.history();
        Ok(SyncStatus {
            dirty_count,
            last_failure: history.last_failure.clone(),
            last_success_at: history.last_success_at,
        })
    }
}
