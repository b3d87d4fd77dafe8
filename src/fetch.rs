//! Chunk fetch collaborator.
//!
//! The engine downloads through this trait so the transport can be swapped
//! out (and scripted in tests). The production implementation pulls chunks
//! over HTTP from one or more mirror sources.

use crate::manifest::ChunkInfo;
use crate::utils::multierr::MultiError;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("chunk {sha1} not found on any source")]
    NotFound { sha1: String },
    #[error("source rejected the request: {reason}")]
    Auth { reason: String },
    #[error("transient network failure: {reason}")]
    Transient { reason: String },
}

impl FetchError {
    /// Only transient failures are worth another attempt; a missing chunk or
    /// rejected credentials will not improve with retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch(&self, depot_id: u32, chunk: &ChunkInfo) -> Result<Vec<u8>, FetchError>;
}

/// Fetches chunks as `{source}/depot/{depot_id}/chunk/{sha1}`.
///
/// Sources are tried in order: a transient failure moves on to the next
/// mirror, a hard failure (not found, auth) is returned immediately.
pub struct HttpChunkFetcher {
    client: reqwest::Client,
    sources: Vec<String>,
}

impl HttpChunkFetcher {
    pub fn new(sources: Vec<String>) -> Self {
        Self::with_client(reqwest::Client::new(), sources)
    }

    pub fn with_client(client: reqwest::Client, sources: Vec<String>) -> Self {
        HttpChunkFetcher { client, sources }
    }

    async fn fetch_one(
        &self,
        source: &str,
        depot_id: u32,
        chunk: &ChunkInfo,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!(
            "{}/depot/{}/chunk/{}",
            source.trim_end_matches('/'),
            depot_id,
            chunk.sha1
        );

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|err| FetchError::Transient {
                    reason: err.to_string(),
                })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                sha1: chunk.sha1.clone(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Auth {
                reason: format!("HTTP {} from {}", status, url),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Transient {
                reason: format!("HTTP {} from {}", status, url),
            });
        }

        response
            .bytes()
            .await
            .map(|body| body.to_vec())
            .map_err(|err| FetchError::Transient {
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch(&self, depot_id: u32, chunk: &ChunkInfo) -> Result<Vec<u8>, FetchError> {
        let mut errs = Vec::new();
        for source in &self.sources {
            match self.fetch_one(source, depot_id, chunk).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_retryable() => errs.push(err),
                Err(err) => return Err(err),
            }
        }
        Err(FetchError::Transient {
            reason: if errs.is_empty() {
                "no chunk sources configured".to_string()
            } else {
                MultiError::new(errs).to_string()
            },
        })
    }
}
