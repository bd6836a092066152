//! Content service layer.
//!
//! This module provides:
//! - `ContentService`: Cache-first reads, local-first saves with background
//!   sync, deletes and cache statistics
//! - `PreloadScheduler`: Detached, cancellable batch fetching ahead of use

pub mod content;
pub mod preload;

pub use content::{CacheStats, ContentError, ContentService, Fetched, GetOptions, Source, SyncReport};
pub use preload::{PreloadHandle, PreloadReport, PreloadScheduler};
