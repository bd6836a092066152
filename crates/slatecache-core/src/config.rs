//! Application configuration management.
//!
//! This module handles loading the client configuration, which
//! includes the server URL, the device id and the cache policy.
//!
//! Configuration is stored at `~/.config/slatecache/config.json`.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "slatecache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// 100 MiB keeps a few months of notes and drawings on a phone.
const DEFAULT_MAX_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Entries not refreshed from the server within a week are expired.
const DEFAULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PRELOAD_BATCH_SIZE: usize = 50;
const DEFAULT_PRELOAD_CONCURRENCY: usize = 4;
const DEFAULT_SYNC_CONCURRENCY: usize = 4;
const DEFAULT_EVICTION_BATCH_SIZE: usize = 64;
const DEFAULT_EVICTION_MAX_PASSES: usize = 256;

/// Storage budget and timing knobs for the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub max_size_bytes: u64,
    pub ttl_secs: u64,
    pub auto_evict_enabled: bool,
    pub network_timeout_secs: u64,
    pub preload_batch_size: usize,
    pub preload_concurrency: usize,
    /// Upstream saves in flight at once when retrying pending edits
    pub sync_concurrency: usize,
    pub eviction_batch_size: usize,
    pub eviction_max_passes: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            ttl_secs: DEFAULT_TTL_SECS,
            auto_evict_enabled: true,
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            preload_batch_size: DEFAULT_PRELOAD_BATCH_SIZE,
            preload_concurrency: DEFAULT_PRELOAD_CONCURRENCY,
            sync_concurrency: DEFAULT_SYNC_CONCURRENCY,
            eviction_batch_size: DEFAULT_EVICTION_BATCH_SIZE,
            eviction_max_passes: DEFAULT_EVICTION_MAX_PASSES,
        }
    }
}

impl CachePolicy {
    /// Huge values mean "never expire" and saturate at the largest duration
    pub fn ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.ttl_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs.max(1))
    }

    // Zero would stall batching loops, so clamp to one
    pub fn preload_batch_size(&self) -> usize {
        self.preload_batch_size.max(1)
    }

    pub fn preload_concurrency(&self) -> usize {
        self.preload_concurrency.max(1)
    }

    pub fn sync_concurrency(&self) -> usize {
        self.sync_concurrency.max(1)
    }

    pub fn eviction_batch_size(&self) -> usize {
        self.eviction_batch_size.max(1)
    }
}

/// Process-wide handle to the active [`CachePolicy`].
///
/// Components read a snapshot per operation. The policy only changes through
/// [`SharedPolicy::update`].
#[derive(Debug, Clone, Default)]
pub struct SharedPolicy {
    inner: Arc<RwLock<CachePolicy>>,
}

impl SharedPolicy {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(policy)),
        }
    }

    pub fn snapshot(&self) -> CachePolicy {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, policy: CachePolicy) {
        info!(
            max_size_bytes = policy.max_size_bytes,
            ttl_secs = policy.ttl_secs,
            auto_evict = policy.auto_evict_enabled,
            "Cache policy updated"
        );
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server_url: Option<String>,
    pub device_id: Option<String>,
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub policy: CachePolicy,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Cache location: explicit override, else per-device under the OS cache dir
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }

        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;

        let mut path = cache_dir.join(APP_NAME);
        if let Some(ref device) = self.device_id {
            path = path.join(device);
        }
        Ok(path)
    }
}
