//! Upstream synchronization of local edits.
//!
//! This module provides:
//! - `DirtyTracker`: Which entries hold unconfirmed local work, and how the
//!   last sync attempts went
//! - `ConflictResolver`: One remote write with version checking and a single
//!   reapply-and-retry on conflict

pub mod dirty;
pub mod resolver;

pub use dirty::{DirtyTracker, SyncFailure, SyncStatus};
pub use resolver::{ConflictResolver, SyncError, SyncOutcome};
