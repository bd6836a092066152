//! Remote content API module.
//!
//! This module defines the `RemoteContentClient` contract the cache
//! consumes, and `HttpContentClient`, its REST implementation.
//!
//! The server is the source of truth: every record carries a version
//! number, and saves against a stale version are answered with the
//! server's current copy instead of being applied.

pub mod client;
pub mod error;
#[cfg(test)]
pub(crate) mod fake;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::EntityKind;

pub use client::{DeviceCredentials, HttpContentClient};
pub use error::RemoteError;

/// A server-confirmed copy of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub id: String,
    pub payload: Vec<u8>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Server applied the write and returned its canonical copy
    Accepted(RemoteRecord),
    /// Submitted version was stale; carries the server's current copy
    Conflict(RemoteRecord),
}

/// Server operations the cache depends on.
///
/// Implementations carry their own device credentials.
#[async_trait]
pub trait RemoteContentClient: Send + Sync {
    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<RemoteRecord, RemoteError>;

    /// Ids unknown to the server are simply absent from the result
    async fn fetch_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    async fn save(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &[u8],
        version: u64,
    ) -> Result<SaveOutcome, RemoteError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError>;
}

/// Bound a remote call; running out of time counts as a network failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}
