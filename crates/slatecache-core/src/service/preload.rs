use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::api::{with_timeout, RemoteContentClient, RemoteRecord};
use crate::cache::{CacheStore, EvictionManager, WriteThrough};
use crate::config::SharedPolicy;
use crate::models::{CacheKey, EntityKind};

/// Outcome of one preload run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub requested: usize,
    pub already_cached: usize,
    pub fetched: usize,
    pub stored: usize,
    /// Fetched, but the cache held unsynced local work for the id
    pub kept_dirty: usize,
    /// Requested ids the server did not return
    pub missing: usize,
    pub failed_batches: usize,
    pub cancelled: bool,
}

/// Handle to a preload task. Dropping it leaves the task running; the
/// scheduler still owns and joins it.
pub struct PreloadHandle {
    scope: String,
    cancel: Arc<AtomicBool>,
    report: oneshot::Receiver<PreloadReport>,
    task: AbortHandle,
}

impl PreloadHandle {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Stop before the next batch or write. Entries already stored stay.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> PreloadReport {
        match self.report.await {
            Ok(report) => report,
            Err(_) => {
                warn!(scope = %self.scope, "Preload task did not complete");
                PreloadReport {
                    cancelled: true,
                    ..PreloadReport::default()
                }
            }
        }
    }
}

/// Fetches batches of entities ahead of use and writes them through the cache.
///
/// One preload runs per scope: scheduling a scope again cancels the
/// previous run for it.
#[derive(Clone)]
pub struct PreloadScheduler {
    remote: Arc<dyn RemoteContentClient>,
    store: Arc<CacheStore>,
    eviction: Arc<EvictionManager>,
    policy: SharedPolicy,
    active: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl PreloadScheduler {
    pub fn new(
        remote: Arc<dyn RemoteContentClient>,
        store: Arc<CacheStore>,
        eviction: Arc<EvictionManager>,
        policy: SharedPolicy,
    ) -> Self {
        Self {
            remote,
            store,
            eviction,
            policy,
            active: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(
        &self,
        kind: EntityKind,
        ids: Vec<String>,
        scope: impl Into<String>,
    ) -> PreloadHandle {
        let scope = scope.into();
        let cancel = Arc::new(AtomicBool::new(false));

        if let Some(previous) = self.active().insert(scope.clone(), Arc::clone(&cancel)) {
            debug!(scope = %scope, "Superseding running preload");
            previous.store(true, Ordering::SeqCst);
        }

        let scheduler = self.clone();
        let task_scope = scope.clone();
        let task_cancel = Arc::clone(&cancel);
        let (tx, report) = oneshot::channel();

        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        let task = tasks.spawn(async move {
            let outcome = scheduler.run(kind, ids, &task_scope, &task_cancel).await;
            scheduler.finish(&task_scope, &task_cancel);
            // The handle may have been dropped
            let _ = tx.send(outcome);
        });

        PreloadHandle {
            scope,
            cancel,
            report,
            task,
        }
    }

    /// Wait for every preload spawned so far, including ones whose handle
    /// was dropped
    pub async fn wait(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Preload task failed");
            }
        }
    }

    /// Signal every running preload to stop
    pub fn cancel_all(&self) {
        for (_, flag) in self.active().drain() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn active_scopes(&self) -> usize {
        self.active().len()
    }

    fn finish(&self, scope: &str, cancel: &Arc<AtomicBool>) {
        let mut active = self.active();
        if active.get(scope).is_some_and(|flag| Arc::ptr_eq(flag, cancel)) {
            active.remove(scope);
        }
    }

    async fn run(
        &self,
        kind: EntityKind,
        ids: Vec<String>,
        scope: &str,
        cancel: &AtomicBool,
    ) -> PreloadReport {
        let policy = self.policy.snapshot();
        let timeout = policy.network_timeout();
        let now = Utc::now();
        let mut report = PreloadReport {
            requested: ids.len(),
            ..PreloadReport::default()
        };

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.store.meta(&CacheKey::new(kind, id.as_str())).await {
                Ok(Some(meta)) if meta.is_fresh(policy.ttl(), now) => report.already_cached += 1,
                Ok(_) => pending.push(id),
                Err(e) => {
                    warn!(kind = %kind, id = %id, error = %e, "Failed to check cache before preload");
                    pending.push(id);
                }
            }
        }

        let batches: Vec<&[String]> = pending.chunks(policy.preload_batch_size()).collect();
        debug!(scope = %scope, pending = pending.len(), batches = batches.len(), "Preload started");

        // Fetch batches with limited concurrency
        for group in batches.chunks(policy.preload_concurrency()) {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }

            let fetches = group.iter().map(|batch| async move {
                let result = with_timeout(timeout, self.remote.fetch_batch(kind, batch)).await;
                (*batch, result)
            });

            for (batch, result) in join_all(fetches).await {
                match result {
                    Ok(records) => {
                        self.store_batch(kind, batch, records, scope, cancel, &mut report)
                            .await
                    }
                    Err(e) => {
                        report.failed_batches += 1;
                        warn!(scope = %scope, size = batch.len(), error = %e, "Preload batch failed");
                    }
                }
            }
        }

        if !report.cancelled {
            match self.eviction.needs_eviction().await {
                Ok(true) => {
                    if let Err(e) = self.eviction.run().await {
                        warn!(error = %e, "Eviction after preload failed");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to check cache size after preload"),
            }
        }

        info!(
            scope = %scope,
            stored = report.stored,
            cached = report.already_cached,
            failed_batches = report.failed_batches,
            cancelled = report.cancelled,
            "Preload finished"
        );
        report
    }

    async fn store_batch(
        &self,
        kind: EntityKind,
        batch: &[String],
        records: Vec<RemoteRecord>,
        scope: &str,
        cancel: &AtomicBool,
        report: &mut PreloadReport,
    ) {
        report.fetched += records.len();
        report.missing += batch
            .iter()
            .filter(|id| !records.iter().any(|r| &r.id == *id))
            .count();

        for record in records {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                return;
            }
            let key = CacheKey::new(kind, record.id);
            match self
                .store
                .write_through(&key, record.payload, record.version, Some(scope.to_string()))
                .await
            {
                Ok(WriteThrough::Stored(_)) => report.stored += 1,
                Ok(WriteThrough::KeptDirty(_)) => report.kept_dirty += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to store preloaded entry"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeRemote;
    use crate::cache::{MemoryStore, SaveMode};
    use crate::config::CachePolicy;
    use std::time::Duration;

    struct Harness {
        remote: Arc<FakeRemote>,
        store: Arc<CacheStore>,
        scheduler: PreloadScheduler,
    }

    fn harness(policy: CachePolicy) -> Harness {
        let remote = Arc::new(FakeRemote::new());
        let store = Arc::new(CacheStore::new(Arc::new(MemoryStore::new())));
        let policy = SharedPolicy::new(policy);
        let eviction = Arc::new(EvictionManager::new(Arc::clone(&store), policy.clone()));
        let scheduler =
            PreloadScheduler::new(remote.clone(), Arc::clone(&store), eviction, policy);
        Harness {
            remote,
            store,
            scheduler,
        }
    }

    fn ids(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| i.to_string()).collect()
    }

    fn seed(remote: &FakeRemote, range: std::ops::Range<usize>) {
        for i in range {
            remote.put(EntityKind::Event, &i.to_string(), b"{}", 1);
        }
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_results_written_clean() {
        let h = harness(CachePolicy {
            preload_batch_size: 4,
            ..CachePolicy::default()
        });
        seed(&h.remote, 0..10);

        let report = h.scheduler.schedule(EntityKind::Event, ids(0..10), "b1").join().await;
        assert_eq!(report.stored, 10);
        assert_eq!(h.remote.batch_sizes(), vec![4, 4, 2]);

        let meta = h.store.meta(&CacheKey::event("3")).await.unwrap().unwrap();
        assert!(!meta.is_dirty);
        assert_eq!(meta.scope.as_deref(), Some("b1"));
        assert_eq!(h.scheduler.active_scopes(), 0);
    }

    #[tokio::test]
    async fn test_fresh_entries_are_not_refetched() {
        let h = harness(CachePolicy::default());
        seed(&h.remote, 0..3);
        h.store
            .save(
                &CacheKey::event("0"),
                b"{}".to_vec(),
                SaveMode::Confirmed {
                    version: 1,
                    scope: None,
                },
            )
            .await
            .unwrap();

        let report = h.scheduler.schedule(EntityKind::Event, ids(0..3), "b1").join().await;
        assert_eq!(report.already_cached, 1);
        assert_eq!(report.stored, 2);
        assert_eq!(h.remote.batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_others() {
        let h = harness(CachePolicy {
            preload_batch_size: 2,
            preload_concurrency: 1,
            ..CachePolicy::default()
        });
        seed(&h.remote, 0..6);
        h.remote.fail_batches_containing("2");

        let report = h.scheduler.schedule(EntityKind::Event, ids(0..6), "b1").join().await;
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.stored, 4);
        assert!(h.store.meta(&CacheKey::event("2")).await.unwrap().is_none());
        assert!(h.store.meta(&CacheKey::event("5")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dirty_entries_are_not_overwritten() {
        let h = harness(CachePolicy::default());
        seed(&h.remote, 0..1);
        let key = CacheKey::event("0");
        h.store
            .save(&key, b"{\"local\":true}".to_vec(), SaveMode::Local { scope: None })
            .await
            .unwrap();
        let report = h.scheduler.schedule(EntityKind::Event, ids(0..1), "b1").join().await;
        assert_eq!(report.already_cached, 1);

        let entry = h.store.peek(&key).await.unwrap().unwrap();
        assert!(entry.is_dirty());
        assert_eq!(entry.payload, b"{\"local\":true}");
    }

    #[tokio::test]
    async fn test_missing_ids_are_reported() {
        let h = harness(CachePolicy::default());
        seed(&h.remote, 0..2);
        let report = h.scheduler.schedule(EntityKind::Event, ids(0..4), "b1").join().await;
        assert_eq!(report.stored, 2);
        assert_eq!(report.missing, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_preload_supersedes_same_scope() {
        let h = harness(CachePolicy {
            preload_batch_size: 1,
            preload_concurrency: 1,
            ..CachePolicy::default()
        });
        seed(&h.remote, 0..5);
        h.remote.set_latency(Duration::from_millis(100));

        let first = h.scheduler.schedule(EntityKind::Event, ids(0..5), "week-42");
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = h.scheduler.schedule(EntityKind::Event, ids(0..1), "week-42");

        let first = first.join().await;
        let second = second.join().await;
        assert!(first.cancelled);
        assert!(first.stored < 5);
        assert!(!second.cancelled);
        // Entries committed before cancellation are kept
        assert!(h.store.meta(&CacheKey::event("0")).await.unwrap().is_some());
        assert_eq!(h.scheduler.active_scopes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_running_preloads() {
        let h = harness(CachePolicy {
            preload_batch_size: 1,
            preload_concurrency: 1,
            ..CachePolicy::default()
        });
        seed(&h.remote, 0..5);
        h.remote.set_latency(Duration::from_millis(100));

        let handle = h.scheduler.schedule(EntityKind::Event, ids(0..5), "b1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.scheduler.cancel_all();

        let report = handle.join().await;
        assert!(report.cancelled);
        assert!(report.stored <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_joins_preloads_whose_handle_was_dropped() {
        let h = harness(CachePolicy {
            preload_batch_size: 1,
            preload_concurrency: 1,
            ..CachePolicy::default()
        });
        seed(&h.remote, 0..5);
        h.remote.set_latency(Duration::from_millis(100));

        drop(h.scheduler.schedule(EntityKind::Event, ids(0..5), "b1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.scheduler.cancel_all();
        h.scheduler.wait().await;

        let calls = h.remote.fetch_batch_calls();
        assert!(calls <= 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.remote.fetch_batch_calls(), calls);
        assert_eq!(h.scheduler.active_scopes(), 0);
    }
}
