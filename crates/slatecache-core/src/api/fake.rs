use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{RemoteContentClient, RemoteError, RemoteRecord, SaveOutcome};
use crate::models::{CacheKey, EntityKind};

#[derive(Debug, Default)]
struct FakeState {
    records: HashMap<CacheKey, RemoteRecord>,
    offline: bool,
    latency: Option<Duration>,
    forced_conflicts: usize,
    failing_ids: Vec<String>,
    fetch_one_calls: usize,
    fetch_batch_calls: usize,
    batch_sizes: Vec<usize>,
    save_calls: usize,
    saved_versions: Vec<u64>,
    delete_calls: usize,
}

/// In-memory versioned server for tests.
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Server-side write, as if another device saved it
    pub fn put(&self, kind: EntityKind, id: &str, payload: &[u8], version: u64) {
        self.state().records.insert(
            CacheKey::new(kind, id),
            RemoteRecord {
                id: id.to_string(),
                payload: payload.to_vec(),
                version,
            },
        );
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<RemoteRecord> {
        self.state().records.get(&CacheKey::new(kind, id)).cloned()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Answer the next `n` saves with a conflict regardless of version
    pub fn force_conflicts(&self, n: usize) {
        self.state().forced_conflicts = n;
    }

    /// Fail any batch request containing `id`
    pub fn fail_batches_containing(&self, id: &str) {
        self.state().failing_ids.push(id.to_string());
    }

    pub fn fetch_one_calls(&self) -> usize {
        self.state().fetch_one_calls
    }

    pub fn fetch_batch_calls(&self) -> usize {
        self.state().fetch_batch_calls
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state().batch_sizes.clone()
    }

    pub fn save_calls(&self) -> usize {
        self.state().save_calls
    }

    pub fn saved_versions(&self) -> Vec<u64> {
        self.state().saved_versions.clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.state().delete_calls
    }

    async fn simulate_network(&self) -> Result<(), RemoteError> {
        let (latency, offline) = {
            let state = self.state();
            (state.latency, state.offline)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(RemoteError::Unavailable("fake server offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteContentClient for FakeRemote {
    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<RemoteRecord, RemoteError> {
        self.state().fetch_one_calls += 1;
        self.simulate_network().await?;
        self.record(kind, id)
            .ok_or_else(|| RemoteError::NotFound(format!("{}:{}", kind, id)))
    }

    async fn fetch_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        {
            let mut state = self.state();
            state.fetch_batch_calls += 1;
            state.batch_sizes.push(ids.len());
        }
        self.simulate_network().await?;

        let state = self.state();
        let failing = state.failing_ids.iter().any(|bad| ids.contains(bad));
        if failing {
            return Err(RemoteError::ServerError("batch failed".to_string()));
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(&CacheKey::new(kind, id.as_str())).cloned())
            .collect())
    }

    async fn save(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &[u8],
        version: u64,
    ) -> Result<SaveOutcome, RemoteError> {
        {
            let mut state = self.state();
            state.save_calls += 1;
            state.saved_versions.push(version);
        }
        self.simulate_network().await?;

        let mut state = self.state();
        let key = CacheKey::new(kind, id);
        let current = state.records.get(&key).cloned();

        if state.forced_conflicts > 0 {
            state.forced_conflicts -= 1;
            let server = current.unwrap_or(RemoteRecord {
                id: id.to_string(),
                payload: payload.to_vec(),
                version: version + 1,
            });
            return Ok(SaveOutcome::Conflict(server));
        }

        let next_version = match current {
            Some(ref record) if record.version != version => {
                return Ok(SaveOutcome::Conflict(record.clone()));
            }
            Some(ref record) => record.version + 1,
            None => version + 1,
        };
        let record = RemoteRecord {
            id: id.to_string(),
            payload: payload.to_vec(),
            version: next_version,
        };
        state.records.insert(key, record.clone());
        Ok(SaveOutcome::Accepted(record))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.state().delete_calls += 1;
        self.simulate_network().await?;
        match self.state().records.remove(&CacheKey::new(kind, id)) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(format!("{}:{}", kind, id))),
        }
    }
}
