//! HTTP client for the content sync server.
//!
//! This module provides the `HttpContentClient` struct for making
//! authenticated requests to fetch and save events, notes and drawings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::{RemoteContentClient, RemoteError, RemoteRecord, SaveOutcome};
use crate::models::EntityKind;

// ============================================================================
// Constants
// ============================================================================

/// API version prefix for all content routes
const API_VERSION: &str = "v1";

/// HTTP request timeout in seconds.
/// The cache applies its own, usually tighter, timeout on top.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Header identifying the registered device
const DEVICE_ID_HEADER: &str = "x-device-id";

/// Credentials issued to this device at registration.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct RecordBody {
    id: String,
    version: u64,
    payload: serde_json::Value,
}

impl RecordBody {
    fn into_record(self) -> Result<RemoteRecord, RemoteError> {
        let payload = serde_json::to_vec(&self.payload)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        Ok(RemoteRecord {
            id: self.id,
            payload,
            version: self.version,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    records: Vec<RecordBody>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct SaveRequest {
    version: u64,
    payload: serde_json::Value,
}

/// Body of a 409 response: the server's current copy
#[derive(Debug, Deserialize)]
struct ConflictBody {
    #[serde(rename = "currentVersion", alias = "version")]
    version: u64,
    #[serde(rename = "currentPayload", alias = "payload")]
    payload: serde_json::Value,
}

/// REST client for the content server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpContentClient {
    client: Client,
    base_url: Url,
    credentials: Option<Arc<DeviceCredentials>>,
}

impl HttpContentClient {
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url,
            credentials: None,
        })
    }

    pub fn set_credentials(&mut self, credentials: DeviceCredentials) {
        self.credentials = Some(Arc::new(credentials));
    }

    fn endpoint(&self, kind: EntityKind, id: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RemoteError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty().push(API_VERSION).push(kind.collection());
            // Drawing ids contain '/', push() percent-encodes it
            if let Some(id) = id {
                path.push(id);
            }
        }
        Ok(url)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, RemoteError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref creds) = self.credentials {
            let bearer = header::HeaderValue::from_str(&format!("Bearer {}", creds.token))
                .map_err(|e| RemoteError::InvalidPayload(format!("device token: {}", e)))?;
            let device = header::HeaderValue::from_str(&creds.device_id)
                .map_err(|e| RemoteError::InvalidPayload(format!("device id: {}", e)))?;
            headers.insert(header::AUTHORIZATION, bearer);
            headers.insert(DEVICE_ID_HEADER, device);
        }
        Ok(headers)
    }

    /// Send a request, backing off and retrying while the server answers 429.
    async fn send<F>(&self, url: &Url, build: F) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().headers(self.auth_headers()?).send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(RemoteError::RateLimited);
            }
            warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response, url: &Url) -> Result<T, RemoteError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl RemoteContentClient for HttpContentClient {
    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<RemoteRecord, RemoteError> {
        let url = self.endpoint(kind, Some(id))?;
        let response = self.send(&url, || self.client.get(url.clone())).await?;
        let response = Self::check_response(response).await?;
        let body: RecordBody = Self::parse(response, &url).await?;
        body.into_record()
    }

    async fn fetch_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.endpoint(kind, None)?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(self.base_url.to_string()))?
            .push("batch");

        let body = BatchRequest { ids };
        let response = self
            .send(&url, || self.client.post(url.clone()).json(&body))
            .await?;
        let response = Self::check_response(response).await?;
        let parsed: BatchResponse = Self::parse(response, &url).await?;
        debug!(kind = %kind, requested = ids.len(), returned = parsed.records.len(), "Batch fetched");

        parsed.records.into_iter().map(RecordBody::into_record).collect()
    }

    async fn save(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &[u8],
        version: u64,
    ) -> Result<SaveOutcome, RemoteError> {
        let url = self.endpoint(kind, Some(id))?;
        let body = SaveRequest {
            version,
            payload: serde_json::from_slice(payload)
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?,
        };

        let response = self
            .send(&url, || self.client.put(url.clone()).json(&body))
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let conflict: ConflictBody = Self::parse(response, &url).await?;
            debug!(kind = %kind, id = id, server_version = conflict.version, "Save rejected with version conflict");
            let record = RecordBody {
                id: id.to_string(),
                version: conflict.version,
                payload: conflict.payload,
            };
            return Ok(SaveOutcome::Conflict(record.into_record()?));
        }

        let response = Self::check_response(response).await?;
        let body: RecordBody = Self::parse(response, &url).await?;
        Ok(SaveOutcome::Accepted(body.into_record()?))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(kind, Some(id))?;
        let response = self.send(&url, || self.client.delete(url.clone())).await?;
        Self::check_response(response).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
