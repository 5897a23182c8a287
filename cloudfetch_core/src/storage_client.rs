//! Access to the cloud storage the chunk files live in
use std::time::Duration;

use anyhow::Error as AnyError;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A failed attempt to fetch a chunk file
///
/// The distinction between a status failure and a transport failure
/// matters: 401/403 mean the presigned URL must be refreshed at the
/// server, everything else is retried locally with backoff.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("download cancelled")]
    Cancelled,
}

impl StorageError {
    /// `true` for the status codes cloud storage uses for expired
    /// presigned URLs.
    pub fn is_expired_signature(&self) -> bool {
        matches!(self, StorageError::Status { status: 401 | 403, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

/// Fetches chunk files from presigned URLs
///
/// All that is required to support another storage transport is to
/// implement this trait.
#[async_trait]
pub trait StorageClient: Send + Sync + 'static {
    /// Issues a GET against `url` with the given extra headers and
    /// returns the complete body.
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Bytes, StorageError>;
}

/// [StorageClient] over a shared [reqwest::Client]
#[derive(Debug, Clone)]
pub struct HttpStorageClient {
    client: reqwest::Client,
}

impl HttpStorageClient {
    /// Creates a client whose requests are bounded by `http_timeout`
    /// in total.
    pub fn new(http_timeout: Duration) -> Result<Self, AnyError> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl StorageClient for HttpStorageClient {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Bytes, StorageError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            response = request.send() => {
                response.map_err(|err| StorageError::Transport(err.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            bytes = response.bytes() => {
                bytes.map_err(|err| StorageError::Transport(err.to_string()))?
            }
        };

        Ok(bytes)
    }
}
