use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::CacheKey;

/// Everything the cache tracks about an entry except its payload.
///
/// Kept small so size aggregation and eviction never touch payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: CacheKey,
    /// Book (collection) the entry belongs to
    #[serde(default)]
    pub scope: Option<String>,
    pub size_bytes: u64,
    /// Last confirmed write-through from the server; `None` until the first one
    #[serde(default)]
    pub cached_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
    #[serde(default)]
    pub is_dirty: bool,
    /// Last server version seen; 0 means never confirmed
    #[serde(default)]
    pub version: u64,
    /// Bumped on every local write, compared when a sync is acknowledged
    #[serde(default)]
    pub revision: u64,
}

impl EntryMeta {
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.cached_at.map(|at| now - at)
    }

    /// Clean entries expire `ttl` after their last server refresh.
    /// An entry that was never confirmed counts as expired.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match self.age(now) {
            Some(age) => age > ttl,
            None => true,
        }
    }

    /// Servable without a network round trip: unsynced local work, or unexpired.
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.is_dirty || !self.is_expired(ttl, now)
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = match self.age(now) {
            Some(age) => age.num_minutes(),
            None => return "never".to_string(),
        };
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub payload: Vec<u8>,
}

impl CacheEntry {
    pub fn key(&self) -> &CacheKey {
        &self.meta.key
    }

    pub fn is_dirty(&self) -> bool {
        self.meta.is_dirty
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }
}
