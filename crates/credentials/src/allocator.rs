use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use skyhaul_protocol::Credential;
use tracing::debug;

use crate::CredentialError;

/// Future returned by [`CredentialAllocator::allocate`].
pub type AllocateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Credential>, CredentialError>> + Send + 'a>>;

/// Source of new upload credentials.
///
/// Implemented over HTTP for production and by fakes in tests.
pub trait CredentialAllocator: Send + Sync {
    /// Requests up to `count` credentials valid for `content_type`.
    fn allocate<'a>(&'a self, content_type: &'a str, count: usize) -> AllocateFuture<'a>;
}

/// Allocator used when no allocation endpoint is configured.
///
/// Always yields an empty batch, so submissions fail with "no credential"
/// unless the workspace cache still holds some.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAllocator;

impl CredentialAllocator for DisabledAllocator {
    fn allocate<'a>(&'a self, _content_type: &'a str, _count: usize) -> AllocateFuture<'a> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[derive(Debug, Serialize)]
struct AllocationRequest<'a> {
    content_type: &'a str,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct AllocationResponse {
    #[serde(default)]
    credentials: Vec<AllocatedCredential>,
}

/// Credential as the endpoint sends it. Fields added by newer endpoints
/// are ignored here; the stored form stays strict.
#[derive(Debug, Deserialize)]
struct AllocatedCredential {
    id: String,
    transfer_url: String,
    public_url: String,
    content_type: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    expires_at: DateTime<Utc>,
    provider: String,
    #[serde(default)]
    resumable: bool,
}

impl From<AllocatedCredential> for Credential {
    fn from(c: AllocatedCredential) -> Self {
        Self {
            id: c.id,
            transfer_url: c.transfer_url,
            public_url: c.public_url,
            content_type: c.content_type,
            expires_at: c.expires_at,
            provider: c.provider,
            resumable: c.resumable,
        }
    }
}

/// Allocates credentials from the remote endpoint with a bearer token.
pub struct HttpAllocator {
    http: reqwest::Client,
    url: String,
}

impl HttpAllocator {
    /// Creates an allocator posting to `url`.
    pub fn new(url: &str, token: &str) -> Result<Self, CredentialError> {
        let mut headers = HeaderMap::new();
        if !token.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| CredentialError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    async fn request(&self, content_type: &str, count: usize) -> Result<Vec<Credential>, CredentialError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&AllocationRequest {
                content_type,
                count,
            })
            .send()
            .await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await?;
        let parsed: AllocationResponse = serde_json::from_slice(&body)?;
        debug!(
            content_type,
            requested = count,
            received = parsed.credentials.len(),
            "allocated upload credentials"
        );
        Ok(parsed.credentials.into_iter().map(Credential::from).collect())
    }
}

impl CredentialAllocator for HttpAllocator {
    fn allocate<'a>(&'a self, content_type: &'a str, count: usize) -> AllocateFuture<'a> {
        Box::pin(self.request(content_type, count))
    }
}
