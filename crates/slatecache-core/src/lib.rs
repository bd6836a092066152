//! Core library for slatecache.
//!
//! Keeps server content (events, handwritten notes, drawings) available
//! offline. Reads are served from a local cache while fresh; saves land
//! locally first and are pushed to the server in the background with
//! optimistic version checks.
//!
//! Entry point is [`ContentService`], built from a [`LocalStore`] backend,
//! a [`RemoteContentClient`] and a [`SharedPolicy`].

pub mod api;
pub mod cache;
pub mod config;
pub mod models;
pub mod service;
pub mod sync;

pub use api::{DeviceCredentials, HttpContentClient, RemoteContentClient, RemoteError};
pub use cache::{EvictionReport, FileStore, LocalStore, MemoryStore};
pub use config::{CachePolicy, Config, SharedPolicy};
pub use models::{CacheKey, Drawing, Entity, EntityKind, Event, Note};
pub use service::{
    CacheStats, ContentError, ContentService, Fetched, GetOptions, PreloadHandle, PreloadReport,
    Source, SyncReport,
};
pub use sync::{SyncOutcome, SyncStatus};
