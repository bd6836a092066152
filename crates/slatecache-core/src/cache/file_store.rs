use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::store::keep_access_stats;
use super::{CacheEntry, EntryMeta, LocalStore, ScanFilter, StoreError};
use crate::models::CacheKey;

/// Metadata for every entry, rewritten on each mutation
const INDEX_FILE: &str = "index.json";

const PAYLOAD_DIR: &str = "payloads";

/// Directory-backed store: a JSON metadata index plus one payload file per entry.
///
/// The index is held in memory and written through on every mutation, so
/// scans and size aggregation never read payload files. Access statistics
/// only reach disk with the next mutation or [`LocalStore::flush`].
pub struct FileStore {
    root: PathBuf,
    index: Mutex<HashMap<CacheKey, EntryMeta>>,
    stats_pending: AtomicBool,
}

impl FileStore {
    pub async fn open(root: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(root.join(PAYLOAD_DIR)).await?;

        let index_path = root.join(INDEX_FILE);
        let mut rebuilt = false;
        let index = match tokio::fs::read_to_string(&index_path).await {
            Ok(contents) => match serde_json::from_str::<Vec<EntryMeta>>(&contents) {
                Ok(metas) => metas.into_iter().map(|m| (m.key.clone(), m)).collect(),
                Err(e) => {
                    let aside = root.join(format!("{}.corrupt", INDEX_FILE));
                    warn!(path = ?index_path, moved_to = ?aside, error = %e, "Cache index unreadable, rebuilding from payload files");
                    tokio::fs::rename(&index_path, &aside).await?;
                    rebuilt = true;
                    recover_index(&root).await?
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(root = ?root, entries = index.len(), "File cache opened");
        let store = Self {
            root,
            index: Mutex::new(index),
            stats_pending: AtomicBool::new(false),
        };
        if rebuilt {
            let index = store.index.lock().await;
            store.persist_index(&index).await?;
        }
        Ok(store)
    }

    fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(PAYLOAD_DIR)
            .join(format!("{}.json", file_name_for(key)))
    }

    async fn persist_index(&self, index: &HashMap<CacheKey, EntryMeta>) -> Result<(), StoreError> {
        let mut metas: Vec<&EntryMeta> = index.values().collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        let contents = serde_json::to_vec(&metas)?;

        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        self.stats_pending.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Index entries for every payload file found under `root`.
///
/// Whether a payload was synced is unknown, so recovered entries are dirty
/// and go out with the next sync instead of being lost.
async fn recover_index(root: &Path) -> Result<HashMap<CacheKey, EntryMeta>, StoreError> {
    let now = Utc::now();
    let mut index = HashMap::new();
    let mut files = tokio::fs::read_dir(root.join(PAYLOAD_DIR)).await?;

    while let Some(file) = files.next_entry().await? {
        let name = file.file_name();
        let key = match name
            .to_str()
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(key_from_file_name)
        {
            Some(key) => key,
            None => {
                warn!(file = ?name, "Skipping unrecognized payload file");
                continue;
            }
        };
        let size_bytes = file.metadata().await?.len();
        index.insert(
            key.clone(),
            EntryMeta {
                key,
                scope: None,
                size_bytes,
                cached_at: None,
                last_accessed_at: now,
                hit_count: 0,
                is_dirty: true,
                version: 0,
                revision: 1,
            },
        );
    }

    warn!(recovered = index.len(), "Recovered cache entries marked unsynced");
    Ok(index)
}

/// Escape a cache key into a portable file name
fn file_name_for(key: &CacheKey) -> String {
    let raw = key.to_string();
    let mut name = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || byte == b'.' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name
}

/// Inverse of [`file_name_for`]
fn key_from_file_name(name: &str) -> Option<CacheKey> {
    let bytes = name.as_bytes();
    let mut raw = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            raw.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            raw.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(raw).ok()?.parse().ok()
}

#[async_trait]
impl LocalStore for FileStore {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let meta = match self.index.lock().await.get(key) {
            Some(meta) => meta.clone(),
            None => return Ok(None),
        };

        let payload = match tokio::fs::read(self.payload_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Corrupt(key.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if payload.len() as u64 != meta.size_bytes {
            return Err(StoreError::Corrupt(key.clone()));
        }

        Ok(Some(CacheEntry { meta, payload }))
    }

    async fn load_meta(&self, key: &CacheKey) -> Result<Option<EntryMeta>, StoreError> {
        Ok(self.index.lock().await.get(key).cloned())
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;
        let meta = keep_access_stats(&entry.meta, index.get(&entry.meta.key));

        tokio::fs::write(self.payload_path(&meta.key), &entry.payload).await?;
        index.insert(meta.key.clone(), meta);
        self.persist_index(&index).await
    }

    async fn update_meta(&self, meta: &EntryMeta) -> Result<bool, StoreError> {
        let mut index = self.index.lock().await;
        let updated = match index.get(&meta.key) {
            Some(existing) => keep_access_stats(meta, Some(existing)),
            None => return Ok(false),
        };
        index.insert(updated.key.clone(), updated);
        self.persist_index(&index).await?;
        Ok(true)
    }

    async fn record_hit(
        &self,
        key: &CacheKey,
        at: DateTime<Utc>,
    ) -> Result<Option<EntryMeta>, StoreError> {
        let mut index = self.index.lock().await;
        Ok(index.get_mut(key).map(|meta| {
            meta.hit_count += 1;
            meta.last_accessed_at = at;
            self.stats_pending.store(true, Ordering::SeqCst);
            meta.clone()
        }))
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let mut index = self.index.lock().await;
        let existed = index.remove(key).is_some();

        match tokio::fs::remove_file(self.payload_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if existed {
            self.persist_index(&index).await?;
        }
        Ok(existed)
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<EntryMeta>, StoreError> {
        Ok(self
            .index
            .lock()
            .await
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let index = self.index.lock().await;
        if self.stats_pending.load(Ordering::SeqCst) {
            self.persist_index(&index).await?;
        }
        Ok(())
    }
}
