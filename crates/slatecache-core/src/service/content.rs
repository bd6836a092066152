use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::preload::{PreloadHandle, PreloadScheduler};
use crate::api::{with_timeout, RemoteContentClient, RemoteError, RemoteRecord};
use crate::cache::{
    CacheEntry, CacheStore, EntryMeta, EvictionManager, EvictionReport, LocalStore, Removal,
    ScanFilter, StoreError, WriteThrough,
};
use crate::config::{CachePolicy, SharedPolicy};
use crate::models::{decode, encode, CacheKey, Drawing, Entity, EntityKind, Event, Note};
use crate::sync::{ConflictResolver, DirtyTracker, SyncError, SyncOutcome, SyncStatus};

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("{0} does not exist on the server")]
    NotFound(CacheKey),

    #[error("{key} is not cached and could not be fetched: {source}")]
    Unavailable {
        key: CacheKey,
        #[source]
        source: RemoteError,
    },

    #[error("Remote call for {key} failed: {source}")]
    Remote {
        key: CacheKey,
        #[source]
        source: RemoteError,
    },

    #[error("Server returned an unreadable payload for {key}: {source}")]
    MalformedRemote {
        key: CacheKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode entity: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Skip the cache and go to the server, falling back to the cache on failure
    pub force_refresh: bool,
}

impl GetOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
}

/// A value returned by [`ContentService::get`], with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub source: Source,
    pub version: u64,
    pub is_dirty: bool,
    pub cached_at: Option<DateTime<Utc>>,
    /// Set when the server could not be reached and a possibly stale copy was served
    pub degraded: Option<String>,
}

impl<T> Fetched<T> {
    fn from_cache(value: T, meta: &EntryMeta, degraded: Option<String>) -> Self {
        Self {
            value,
            source: Source::Cache,
            version: meta.version,
            is_dirty: meta.is_dirty,
            cached_at: meta.cached_at,
            degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub count: usize,
    pub size_bytes: u64,
    pub dirty_count: usize,
    pub hits: u64,
    pub misses: u64,
    /// Share of reads served from the cache without a fetch, 0.0 before any read
    pub hit_rate: f64,
}

/// Outcome of pushing pending local edits upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub superseded: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Stopped early because the server was unreachable
    pub offline: bool,
}

/// Cache-first access to server content.
///
/// Reads are served from the cache while fresh and fall back to a stale copy
/// when the server is unreachable. Saves land in the cache as dirty before any
/// network activity and are pushed upstream by background tasks.
pub struct ContentService {
    store: Arc<CacheStore>,
    remote: Arc<dyn RemoteContentClient>,
    policy: SharedPolicy,
    tracker: Arc<DirtyTracker>,
    resolver: Arc<ConflictResolver>,
    eviction: Arc<EvictionManager>,
    preloader: PreloadScheduler,
    syncs: Mutex<JoinSet<()>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentService {
    pub fn new(
        backend: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteContentClient>,
        policy: SharedPolicy,
    ) -> Self {
        let store = Arc::new(CacheStore::new(backend));
        let tracker = Arc::new(DirtyTracker::new(Arc::clone(&store)));
        let resolver = Arc::new(ConflictResolver::new(
            Arc::clone(&remote),
            Arc::clone(&store),
            Arc::clone(&tracker),
            policy.clone(),
        ));
        resolver.register::<Event>();
        resolver.register::<Note>();
        resolver.register::<Drawing>();

        let eviction = Arc::new(EvictionManager::new(Arc::clone(&store), policy.clone()));
        let preloader = PreloadScheduler::new(
            Arc::clone(&remote),
            Arc::clone(&store),
            Arc::clone(&eviction),
            policy.clone(),
        );

        Self {
            store,
            remote,
            policy,
            tracker,
            resolver,
            eviction,
            preloader,
            syncs: Mutex::new(JoinSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn syncs(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.syncs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run once at process start: expire and trim the cache if allowed.
    pub async fn startup(&self) -> Result<Option<EvictionReport>, ContentError> {
        let dirty = self.tracker.list_dirty(None).await?.len();
        if dirty > 0 {
            info!(dirty, "Cache holds unsynced local changes");
        }
        if !self.policy.snapshot().auto_evict_enabled {
            debug!("Auto-eviction disabled, skipping startup eviction");
            return Ok(None);
        }
        Ok(Some(self.eviction.run().await?))
    }

    // ===== Read path =====

    pub async fn get<T: Entity>(
        &self,
        id: &str,
        options: GetOptions,
    ) -> Result<Fetched<T>, ContentError> {
        let key = CacheKey::new(T::KIND, id);
        let policy = self.policy.snapshot();
        let cached = self.read_cached::<T>(&key).await?;

        if !options.force_refresh {
            if let Some((ref entry, ref value)) = cached {
                if entry.meta.is_fresh(policy.ttl(), Utc::now()) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Fetched::from_cache(value.clone(), &entry.meta, None));
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let fetched = with_timeout(policy.network_timeout(), self.remote.fetch_one(T::KIND, id)).await;
        match fetched {
            Ok(record) => self.accept_fetched(&key, record).await,
            Err(e) if e.is_not_found() => {
                match cached {
                    // Created locally and not yet synced
                    Some((entry, value)) if entry.is_dirty() => {
                        Ok(Fetched::from_cache(value, &entry.meta, Some(e.to_string())))
                    }
                    _ => {
                        if self.store.remove_if_clean(&key).await? == Removal::Removed {
                            info!(key = %key, "Removed from server, invalidated cache entry");
                        }
                        Err(ContentError::NotFound(key))
                    }
                }
            }
            Err(e) => match cached {
                Some((entry, value)) => {
                    warn!(key = %key, error = %e, age = %entry.meta.age_display(Utc::now()), "Fetch failed, serving cached copy");
                    Ok(Fetched::from_cache(value, &entry.meta, Some(e.to_string())))
                }
                None => Err(ContentError::Unavailable { key, source: e }),
            },
        }
    }

    /// Cached entry with its decoded value. Undecodable entries are dropped.
    async fn read_cached<T: Entity>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<(CacheEntry, T)>, ContentError> {
        let entry = match self.store.get(key).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        match decode::<T>(&entry.payload) {
            Ok(value) => Ok(Some((entry, value))),
            Err(e) => {
                warn!(key = %key, error = %e, "Malformed cache entry, treating as miss");
                self.store.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn accept_fetched<T: Entity>(
        &self,
        key: &CacheKey,
        record: RemoteRecord,
    ) -> Result<Fetched<T>, ContentError> {
        let value: T = decode(&record.payload).map_err(|source| ContentError::MalformedRemote {
            key: key.clone(),
            source,
        })?;
        let version = record.version;

        let stored = self
            .store
            .write_through(key, record.payload, version, value.scope())
            .await?;
        let fetched = match stored {
            WriteThrough::Stored(meta) => Fetched {
                value,
                source: Source::Network,
                version,
                is_dirty: false,
                cached_at: meta.cached_at,
                degraded: None,
            },
            WriteThrough::KeptDirty(entry) => match decode::<T>(&entry.payload) {
                Ok(local) => Fetched::from_cache(local, &entry.meta, None),
                Err(_) => Fetched {
                    value,
                    source: Source::Network,
                    version,
                    is_dirty: false,
                    cached_at: None,
                    degraded: None,
                },
            },
        };

        self.maybe_evict().await;
        Ok(fetched)
    }

    // ===== Write path =====

    /// Store locally as dirty and sync in the background.
    ///
    /// Succeeds whenever the local write does; network state never fails a save.
    pub async fn save<T: Entity>(&self, value: &T) -> Result<EntryMeta, ContentError> {
        self.resolver.register::<T>();
        let key = value.cache_key();
        let payload = encode(value)?;

        let meta = self.tracker.mark_dirty(&key, payload, value.scope()).await?;
        debug!(key = %key, revision = meta.revision, "Saved locally, scheduling sync");

        self.spawn_sync(key);
        self.maybe_evict().await;
        Ok(meta)
    }

    fn spawn_sync(&self, key: CacheKey) {
        let resolver = Arc::clone(&self.resolver);
        let mut syncs = self.syncs();
        // Reap finished tasks so the set does not grow with every save
        while syncs.try_join_next().is_some() {}
        syncs.spawn(async move {
            // Failures are recorded by the resolver; the entry stays dirty
            if let Ok(outcome) = resolver.sync(&key).await {
                debug!(key = %key, ?outcome, "Background sync done");
            }
        });
    }

    /// Delete on the server, then locally.
    ///
    /// Waits for any in-flight sync of the key. If the server cannot be
    /// reached the local entry is kept and the error returned.
    pub async fn delete<T: Entity>(&self, id: &str) -> Result<(), ContentError> {
        let key = CacheKey::new(T::KIND, id);
        let _in_flight = self.store.lock_for_sync(&key).await;

        let timeout = self.policy.snapshot().network_timeout();
        match with_timeout(timeout, self.remote.delete(T::KIND, id)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(key = %key, "Already deleted on server"),
            Err(source) => return Err(ContentError::Remote { key, source }),
        }

        self.store.delete(&key).await?;
        info!(key = %key, "Deleted");
        Ok(())
    }

    // ===== Sync =====

    /// Push one entry upstream now
    pub async fn sync_key(&self, key: &CacheKey) -> Result<SyncOutcome, ContentError> {
        Ok(self.resolver.sync(key).await?)
    }

    /// Retry every dirty entry, optionally limited to one scope.
    pub async fn sync_pending(&self, scope: Option<&str>) -> Result<SyncReport, ContentError> {
        let dirty = self.tracker.list_dirty(scope).await?;
        let concurrency = self.policy.snapshot().sync_concurrency();
        let mut report = SyncReport::default();

        for group in dirty.chunks(concurrency) {
            let results = join_all(group.iter().map(|meta| self.resolver.sync(&meta.key))).await;
            for result in results {
                report.attempted += 1;
                match result {
                    Ok(SyncOutcome::Accepted { .. }) => report.synced += 1,
                    Ok(SyncOutcome::Superseded { .. }) => report.superseded += 1,
                    Ok(SyncOutcome::AlreadyClean | SyncOutcome::Missing) => {}
                    Err(e) if e.is_conflict() => report.conflicts += 1,
                    Err(e) => {
                        report.failed += 1;
                        if e.is_offline() {
                            report.offline = true;
                        }
                    }
                }
            }
            if report.offline {
                warn!(remaining = dirty.len() - report.attempted, "Server unreachable, stopping sync");
                break;
            }
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            conflicts = report.conflicts,
            failed = report.failed,
            "Pending sync finished"
        );
        Ok(report)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, ContentError> {
        Ok(self.tracker.status().await?)
    }

    // ===== Preload & maintenance =====

    /// Fetch `ids` in the background. Failures are logged, never returned.
    pub fn preload(
        &self,
        kind: EntityKind,
        ids: Vec<String>,
        scope: impl Into<String>,
    ) -> PreloadHandle {
        self.preloader.schedule(kind, ids, scope)
    }

    pub async fn get_cache_stats(&self) -> Result<CacheStats, ContentError> {
        let entries = self.store.scan(&ScanFilter::all()).await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = hits + misses;

        Ok(CacheStats {
            count: entries.len(),
            size_bytes: entries.iter().map(|m| m.size_bytes).sum(),
            dirty_count: entries.iter().filter(|m| m.is_dirty).count(),
            hits,
            misses,
            hit_rate: if reads == 0 {
                0.0
            } else {
                hits as f64 / reads as f64
            },
        })
    }

    /// Run eviction now, regardless of the auto-evict setting
    pub async fn evict(&self) -> Result<EvictionReport, ContentError> {
        Ok(self.eviction.run().await?)
    }

    pub async fn update_policy(&self, policy: CachePolicy) {
        self.policy.update(policy);
        self.maybe_evict().await;
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy.snapshot()
    }

    async fn maybe_evict(&self) {
        match self.eviction.needs_eviction().await {
            Ok(true) => {
                if let Err(e) = self.eviction.run().await {
                    warn!(error = %e, "Eviction failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to check cache size"),
        }
    }

    /// Wait for background syncs started so far
    pub async fn flush(&self) {
        let mut syncs = std::mem::take(&mut *self.syncs());
        while let Some(result) = syncs.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background sync task failed");
            }
        }
    }

    /// Cancel and join preloads, let in-flight syncs finish and persist
    /// access statistics.
    pub async fn shutdown(&self) {
        self.preloader.cancel_all();
        self.preloader.wait().await;
        self.flush().await;
        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Failed to persist cache statistics");
        }
        info!("Content service stopped");
    }
}
