//! Local caching module for offline content access.
//!
//! This module provides the `CacheStore` for storing and retrieving
//! server content locally, plus the `EvictionManager` that keeps the
//! store within its size budget.
//!
//! Storage backends implement `LocalStore`:
//! - `MemoryStore`: process-local map, used for tests and ephemeral sessions
//! - `FileStore`: JSON index plus one payload file per entry

pub mod entry;
pub mod eviction;
pub mod file_store;
pub mod locks;
pub mod manager;
pub mod store;

pub use entry::{CacheEntry, EntryMeta};
pub use eviction::{EvictionManager, EvictionReport};
pub use file_store::FileStore;
pub use locks::KeyLocks;
pub use manager::{CacheStore, Confirmation, Removal, SaveMode, WriteThrough};
pub use store::{LocalStore, MemoryStore, ScanFilter, StoreError};
