use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CacheStore, EntryMeta, Removal, ScanFilter, StoreError};
use crate::config::SharedPolicy;

/// What one eviction run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub expired: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
    pub size_before: u64,
    pub size_after: u64,
    pub budget: u64,
    pub passes: usize,
    /// Candidates that turned dirty between scan and deletion
    pub skipped_dirty: usize,
    /// Stopped at `eviction_max_passes` with work left
    pub pass_limit_reached: bool,
    /// Budget could not be met without touching unsynced entries
    pub over_budget: bool,
}

impl EvictionReport {
    pub fn removed(&self) -> usize {
        self.expired + self.evicted
    }

    fn tally(&mut self, meta: &EntryMeta, removal: Removal) -> bool {
        match removal {
            Removal::Removed => {
                self.bytes_freed += meta.size_bytes;
                true
            }
            Removal::KeptDirty => {
                self.skipped_dirty += 1;
                false
            }
            Removal::Absent => false,
        }
    }
}

/// Keeps the cache within its storage budget using TTL expiry, then LRU.
///
/// Dirty entries are never removed. Each candidate is re-checked under
/// its key lock at deletion time, so a save racing with eviction wins.
/// Runs are serialized; a run queued behind another starts from the
/// sizes the first one left.
pub struct EvictionManager {
    store: Arc<CacheStore>,
    policy: SharedPolicy,
    running: Mutex<()>,
}

impl EvictionManager {
    pub fn new(store: Arc<CacheStore>, policy: SharedPolicy) -> Self {
        Self {
            store,
            policy,
            running: Mutex::new(()),
        }
    }

    /// True when auto-eviction is on and the cache exceeds its budget
    pub async fn needs_eviction(&self) -> Result<bool, StoreError> {
        let policy = self.policy.snapshot();
        if !policy.auto_evict_enabled {
            return Ok(false);
        }
        Ok(self.store.size_bytes().await? > policy.max_size_bytes)
    }

    /// Run both phases regardless of the auto-evict setting
    pub async fn run(&self) -> Result<EvictionReport, StoreError> {
        let _running = self.running.lock().await;

        let policy = self.policy.snapshot();
        let batch_size = policy.eviction_batch_size();
        let now = Utc::now();

        let mut report = EvictionReport {
            size_before: self.store.size_bytes().await?,
            budget: policy.max_size_bytes,
            ..EvictionReport::default()
        };

        // Phase 1: expire clean entries past their TTL
        let expired: Vec<EntryMeta> = self
            .store
            .scan(&ScanFilter::clean())
            .await?
            .into_iter()
            .filter(|m| m.is_expired(policy.ttl(), now))
            .collect();

        for batch in expired.chunks(batch_size) {
            if report.passes >= policy.eviction_max_passes {
                report.pass_limit_reached = true;
                break;
            }
            report.passes += 1;
            for meta in batch {
                let removal = self.store.remove_if_clean(&meta.key).await?;
                if report.tally(meta, removal) {
                    report.expired += 1;
                }
            }
        }

        // Phase 2: least-used clean entries until under budget
        loop {
            let size = self.store.size_bytes().await?;
            if size <= policy.max_size_bytes {
                break;
            }
            if report.passes >= policy.eviction_max_passes {
                report.pass_limit_reached = true;
                break;
            }

            let mut candidates = self.store.scan(&ScanFilter::clean()).await?;
            if candidates.is_empty() {
                report.over_budget = true;
                break;
            }
            report.passes += 1;
            candidates.sort_by(|a, b| {
                a.hit_count
                    .cmp(&b.hit_count)
                    .then(a.last_accessed_at.cmp(&b.last_accessed_at))
            });

            let mut excess = size - policy.max_size_bytes;
            for meta in candidates.iter().take(batch_size) {
                if excess == 0 {
                    break;
                }
                let removal = self.store.remove_if_clean(&meta.key).await?;
                if report.tally(meta, removal) {
                    debug!(key = %meta.key, hits = meta.hit_count, "Evicted cache entry");
                    report.evicted += 1;
                    excess = excess.saturating_sub(meta.size_bytes);
                }
            }
        }

        report.size_after = self.store.size_bytes().await?;
        if report.over_budget {
            warn!(
                size = report.size_after,
                budget = report.budget,
                "Cache over budget; remaining entries hold unsynced changes"
            );
        } else if report.pass_limit_reached && report.size_after > report.budget {
            warn!(
                passes = report.passes,
                size = report.size_after,
                budget = report.budget,
                "Eviction pass limit reached, cache still over budget"
            );
        } else if report.removed() > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                size = report.size_after,
                "Cache eviction complete"
            );
        }
        Ok(report)
    }
}
