use serde::{de::DeserializeOwned, Serialize};

use super::{CacheKey, EntityKind};

/// A piece of server-versioned content the cache can hold.
///
/// Payloads are stored as JSON bytes; the cache itself never looks inside them.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Server-side id of this entity within its kind
    fn cache_id(&self) -> String;

    /// Book (collection) this entity belongs to, used for scoped sync and preload
    fn scope(&self) -> Option<String> {
        None
    }

    /// Reapply this locally edited entity on top of the server's newer copy.
    ///
    /// The default keeps the caller's whole object: last write wins.
    fn rebase(&self, _server: &Self) -> Self {
        self.clone()
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::new(Self::KIND, self.cache_id())
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}
