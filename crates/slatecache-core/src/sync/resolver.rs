use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use super::DirtyTracker;
use crate::api::{with_timeout, RemoteContentClient, RemoteError, RemoteRecord, SaveOutcome};
use crate::cache::{CacheEntry, CacheStore, Confirmation, StoreError};
use crate::config::SharedPolicy;
use crate::models::{decode, encode, CacheKey, Entity, EntityKind};

/// Reapplies a local payload onto the server's newer payload
type Rebaser = Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>, serde_json::Error> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Server accepted the write; entry is clean at `version`
    Accepted { version: u64, retried: bool },
    /// Server accepted, but a newer local edit is still pending
    Superseded { version: u64 },
    /// Nothing to send
    AlreadyClean,
    /// Entry disappeared locally before or during the sync
    Missing,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Version conflict on {key} persisted after retry (server at version {server_version})")]
    Conflict { key: CacheKey, server_version: u64 },

    #[error("Remote save failed for {key}: {source}")]
    Remote {
        key: CacheKey,
        #[source]
        source: RemoteError,
    },

    #[error("Failed to reapply {key} onto the server copy: {source}")]
    Rebase {
        key: CacheKey,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Transient failure; a later retry may succeed
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::Remote { source, .. } if source.is_offline())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }
}

/// Performs one optimistic-concurrency write per call.
///
/// The local payload is submitted with the last confirmed version. On a
/// conflict the local change is reapplied onto the server's copy and
/// resubmitted exactly once; a second conflict is a hard failure and the
/// entry stays dirty.
pub struct ConflictResolver {
    remote: Arc<dyn RemoteContentClient>,
    store: Arc<CacheStore>,
    tracker: Arc<DirtyTracker>,
    policy: SharedPolicy,
    rebasers: RwLock<HashMap<EntityKind, Rebaser>>,
}

impl ConflictResolver {
    pub fn new(
        remote: Arc<dyn RemoteContentClient>,
        store: Arc<CacheStore>,
        tracker: Arc<DirtyTracker>,
        policy: SharedPolicy,
    ) -> Self {
        Self {
            remote,
            store,
            tracker,
            policy,
            rebasers: RwLock::new(HashMap::new()),
        }
    }

    /// Use `T::rebase` when resolving conflicts for `T::KIND`.
    /// Kinds without a registration resubmit the local payload unchanged.
    pub fn register<T: Entity>(&self) {
        let rebaser: Rebaser = Arc::new(|local: &[u8], server: &[u8]| {
            let local: T = decode(local)?;
            let server: T = decode(server)?;
            encode(&local.rebase(&server))
        });
        self.rebasers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(T::KIND)
            .or_insert(rebaser);
    }

    fn rebase(
        &self,
        kind: EntityKind,
        local: &[u8],
        server: &[u8],
    ) -> Result<Vec<u8>, serde_json::Error> {
        let rebaser = self
            .rebasers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        match rebaser {
            Some(rebase) => rebase(local, server),
            None => Ok(local.to_vec()),
        }
    }

    /// Push the current local state of `key` upstream.
    pub async fn sync(&self, key: &CacheKey) -> Result<SyncOutcome, SyncError> {
        let _in_flight = self.store.lock_for_sync(key).await;

        let entry = match self.store.peek(key).await? {
            Some(entry) if entry.is_dirty() => entry,
            Some(_) => return Ok(SyncOutcome::AlreadyClean),
            None => return Ok(SyncOutcome::Missing),
        };

        match self.attempt(&entry).await {
            Ok(outcome) => {
                debug!(key = %key, ?outcome, "Sync finished");
                Ok(outcome)
            }
            Err(e) => {
                self.tracker.record_failure(key, &e, e.is_conflict());
                Err(e)
            }
        }
    }

    async fn attempt(&self, entry: &CacheEntry) -> Result<SyncOutcome, SyncError> {
        let key = entry.key();

        let server = match self.submit(key, &entry.payload, entry.version()).await? {
            SaveOutcome::Accepted(record) => return self.acknowledge(entry, &record, false).await,
            SaveOutcome::Conflict(server) => server,
        };

        info!(
            key = %key,
            local_version = entry.version(),
            server_version = server.version,
            "Version conflict, reapplying local change onto server copy"
        );
        let rebased = self
            .rebase(key.kind, &entry.payload, &server.payload)
            .map_err(|source| SyncError::Rebase {
                key: key.clone(),
                source,
            })?;

        match self.submit(key, &rebased, server.version).await? {
            SaveOutcome::Accepted(record) => self.acknowledge(entry, &record, true).await,
            SaveOutcome::Conflict(again) => Err(SyncError::Conflict {
                key: key.clone(),
                server_version: again.version,
            }),
        }
    }

    async fn submit(
        &self,
        key: &CacheKey,
        payload: &[u8],
        version: u64,
    ) -> Result<SaveOutcome, SyncError> {
        let timeout = self.policy.snapshot().network_timeout();
        with_timeout(timeout, self.remote.save(key.kind, &key.id, payload, version))
            .await
            .map_err(|source| SyncError::Remote {
                key: key.clone(),
                source,
            })
    }

    async fn acknowledge(
        &self,
        entry: &CacheEntry,
        record: &RemoteRecord,
        retried: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let confirmation = self
            .tracker
            .clear_on_ack(entry.key(), entry.meta.revision, record)
            .await?;
        Ok(match confirmation {
            Confirmation::Clean => SyncOutcome::Accepted {
                version: record.version,
                retried,
            },
            Confirmation::Superseded => SyncOutcome::Superseded {
                version: record.version,
            },
            Confirmation::Missing => SyncOutcome::Missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeRemote;
    use crate::cache::{MemoryStore, SaveMode};
    use crate::config::CachePolicy;
    use crate::models::Note;
    use std::time::Duration;

    struct Harness {
        remote: Arc<FakeRemote>,
        store: Arc<CacheStore>,
        tracker: Arc<DirtyTracker>,
        resolver: ConflictResolver,
    }

    fn harness(policy: CachePolicy) -> Harness {
        let remote = Arc::new(FakeRemote::new());
        let store = Arc::new(CacheStore::new(Arc::new(MemoryStore::new())));
        let tracker = Arc::new(DirtyTracker::new(Arc::clone(&store)));
        let resolver = ConflictResolver::new(
            remote.clone(),
            Arc::clone(&store),
            Arc::clone(&tracker),
            SharedPolicy::new(policy),
        );
        Harness {
            remote,
            store,
            tracker,
            resolver,
        }
    }

    fn note(strokes: usize) -> Note {
        Note {
            event_id: "9".to_string(),
            book_id: "b1".to_string(),
            strokes: vec![
                crate::models::Stroke {
                    points: vec![],
                    width: 1.0,
                    color: 0,
                    eraser: false,
                };
                strokes
            ],
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_accepted_clears_dirty_and_takes_server_version() {
        let h = harness(CachePolicy::default());
        let key = CacheKey::note("9");
        h.tracker
            .mark_dirty(&key, encode(&note(1)).unwrap(), None)
            .await
            .unwrap();

        let outcome = h.resolver.sync(&key).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Accepted {
                version: 1,
                retried: false
            }
        );
        let meta = h.store.meta(&key).await.unwrap().unwrap();
        assert!(!meta.is_dirty);
        assert_eq!(meta.version, 1);
    }

    #[tokio::test]
    async fn test_conflict_retries_once_on_server_version() {
        let h = harness(CachePolicy::default());
        h.resolver.register::<Note>();
        let key = CacheKey::note("9");

        // Local copy last confirmed at version 1; server has moved to 3
        h.store
            .save(&key, encode(&note(0)).unwrap(), SaveMode::Confirmed { version: 1, scope: None })
            .await
            .unwrap();
        h.tracker
            .mark_dirty(&key, encode(&note(2)).unwrap(), None)
            .await
            .unwrap();
        h.remote.put(EntityKind::Note, "9", &encode(&note(5)).unwrap(), 3);

        let outcome = h.resolver.sync(&key).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Accepted {
                version: 4,
                retried: true
            }
        );
        assert_eq!(h.remote.saved_versions(), vec![1, 3]);

        let entry = h.store.peek(&key).await.unwrap().unwrap();
        assert!(!entry.is_dirty());
        assert_eq!(entry.version(), 4);
        let stored: Note = decode(&entry.payload).unwrap();
        assert_eq!(stored.strokes.len(), 2);
    }

    #[tokio::test]
    async fn test_second_conflict_fails_without_third_attempt() {
        let h = harness(CachePolicy::default());
        let key = CacheKey::note("9");
        h.tracker
            .mark_dirty(&key, encode(&note(1)).unwrap(), None)
            .await
            .unwrap();
        h.remote.force_conflicts(2);

        let err = h.resolver.sync(&key).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(h.remote.save_calls(), 2);
        assert!(h.tracker.is_dirty(&key).await.unwrap());

        let status = h.tracker.status().await.unwrap();
        assert!(status.last_failure.unwrap().conflict);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_dirty() {
        let h = harness(CachePolicy::default());
        let key = CacheKey::note("9");
        let payload = encode(&note(1)).unwrap();
        h.tracker.mark_dirty(&key, payload.clone(), None).await.unwrap();
        h.remote.set_offline(true);

        let err = h.resolver.sync(&key).await.unwrap_err();
        assert!(err.is_offline());
        let entry = h.store.peek(&key).await.unwrap().unwrap();
        assert!(entry.is_dirty());
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_network_failure() {
        let h = harness(CachePolicy {
            network_timeout_secs: 2,
            ..CachePolicy::default()
        });
        let key = CacheKey::note("9");
        h.tracker
            .mark_dirty(&key, encode(&note(1)).unwrap(), None)
            .await
            .unwrap();
        h.remote.set_latency(Duration::from_secs(60));

        let err = h.resolver.sync(&key).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Remote {
                source: RemoteError::Timeout(_),
                ..
            }
        ));
        assert!(h.tracker.is_dirty(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_and_missing_entries_are_skipped() {
        let h = harness(CachePolicy::default());
        let key = CacheKey::note("9");
        assert_eq!(h.resolver.sync(&key).await.unwrap(), SyncOutcome::Missing);

        h.store
            .save(&key, b"{}".to_vec(), SaveMode::Confirmed { version: 2, scope: None })
            .await
            .unwrap();
        assert_eq!(h.resolver.sync(&key).await.unwrap(), SyncOutcome::AlreadyClean);
        assert_eq!(h.remote.save_calls(), 0);
    }

    #[test]
    fn test_unregistered_kind_resubmits_local_payload() {
        let h = harness(CachePolicy::default());
        let rebased = h.resolver.rebase(EntityKind::Drawing, b"local", b"server").unwrap();
        assert_eq!(rebased, b"local");
    }
}
