//! The moving parts of the pipeline
//!
//! The fetcher feeds descriptors into a bounded queue, the downloader
//! driver turns them into per-chunk tasks and publishes promises to
//! the result queue, the [DownloadManager] wires both ends together
//! and is what the reader talks to.
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::errors::CloudFetchError;

mod downloader;
mod manager;

pub use manager::DownloadManager;
pub(crate) use downloader::Downloader;


/// Terminal-state control shared by every stage
///
/// Combines the first-writer-wins error cell with the cooperative stop
/// signal. Failing the pipeline cancels it; cancelling it without an
/// error is a silent stop.
#[derive(Debug, Clone)]
pub struct PipelineControl {
    error: Arc<Mutex<Option<CloudFetchError>>>,
    cancel: CancellationToken,
}

impl PipelineControl {
    pub fn new() -> Self {
        Self {
            error: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Puts the pipeline into the terminal error state.
    ///
    /// The first error wins; later ones are dropped. Always cancels.
    pub fn fail(&self, err: CloudFetchError) {
        {
            let mut slot = self.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    /// Stops the pipeline without recording an error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn error(&self) -> Option<CloudFetchError> {
        self.error.lock().unwrap().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Default for PipelineControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Reusable scratch buffers for LZ4 decompression
///
/// Chunk tasks decompress into a pooled buffer so repeated downloads
/// do not re-grow a fresh allocation each time.
#[derive(Debug, Clone)]
pub(crate) struct BufferPool {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(Vec::new())),
            max_pooled,
        }
    }

    pub fn take(&self) -> Vec<u8> {
        self.buffers.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn give_back(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }
}
