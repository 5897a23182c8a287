//! Error types returned by the pipeline
use thiserror::Error;

/// A kind of a [CloudFetchError]
///
/// Only terminal conditions appear here. Expired URLs and transient
/// download failures are handled inside the downloader and only
/// escalate to [CloudFetchErrorKind::DownloadFailed] once their
/// budgets are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFetchErrorKind {
    /// A fetcher RPC against the server failed
    ServerFetch,
    /// A chunk download exhausted its retry or URL refresh budget
    DownloadFailed,
    /// An LZ4 payload could not be decompressed
    Decompression,
    /// An Arrow IPC stream could not be decoded
    Decode,
    /// The pipeline was stopped or the reader was dropped
    Cancelled,
    /// API misuse, e.g. using a manager after it was stopped
    InvalidState,
}

impl std::fmt::Display for CloudFetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudFetchErrorKind::ServerFetch => write!(f, "server fetch failed"),
            CloudFetchErrorKind::DownloadFailed => write!(f, "download failed"),
            CloudFetchErrorKind::Decompression => write!(f, "decompression failed"),
            CloudFetchErrorKind::Decode => write!(f, "decode failed"),
            CloudFetchErrorKind::Cancelled => write!(f, "cancelled"),
            CloudFetchErrorKind::InvalidState => write!(f, "invalid state"),
        }
    }
}

/// The error type used by the pipeline
///
/// Errors are cloneable because a terminal error is stored once and
/// then returned from every subsequent consumer call.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct CloudFetchError {
    message: String,
    kind: CloudFetchErrorKind,
    #[source]
    related: Option<Box<CloudFetchError>>,
}

impl CloudFetchError {
    pub fn new<T: Into<String>>(kind: CloudFetchErrorKind, message: T) -> Self {
        Self {
            message: message.into(),
            kind,
            related: None,
        }
    }

    pub fn new_server_fetch<T: Into<String>>(message: T) -> Self {
        Self::new(CloudFetchErrorKind::ServerFetch, message)
    }

    pub fn new_download_failed<T: Into<String>>(message: T) -> Self {
        Self::new(CloudFetchErrorKind::DownloadFailed, message)
    }

    pub fn new_decompression<T: Into<String>>(message: T) -> Self {
        Self::new(CloudFetchErrorKind::Decompression, message)
    }

    pub fn new_decode<T: Into<String>>(message: T) -> Self {
        Self::new(CloudFetchErrorKind::Decode, message)
    }

    pub fn new_cancelled() -> Self {
        Self::new(CloudFetchErrorKind::Cancelled, "the pipeline was cancelled")
    }

    pub fn new_invalid_state<T: Into<String>>(message: T) -> Self {
        Self::new(CloudFetchErrorKind::InvalidState, message)
    }

    pub fn kind(&self) -> CloudFetchErrorKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == CloudFetchErrorKind::Cancelled
    }

    /// Attaches a second root cause.
    ///
    /// Used when both the downloader and the fetcher failed so the
    /// consumer can inspect both. The kind of `self` stays authoritative.
    pub fn with_related(mut self, related: CloudFetchError) -> Self {
        self.related = Some(Box::new(related));
        self
    }

    /// The other error this one was aggregated with, if any.
    pub fn related(&self) -> Option<&CloudFetchError> {
        self.related.as_deref()
    }
}

impl From<arrow_schema::ArrowError> for CloudFetchError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        CloudFetchError::new_decode(format!("arrow ipc error: {err}"))
    }
}
