//! Download results as published to the result queue
//!
//! A [DownloadResult] is published the moment the downloader *begins*
//! work on a descriptor, not when the data arrives. It acts as a
//! promise: the reader blocks on it when it reaches it, which is what
//! preserves chunk order without a reorder buffer.
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::sync::OwnedSemaphorePermit;

use crate::budget::BudgetReservation;
use crate::descriptor::ChunkMeta;
use crate::errors::CloudFetchError;

/// Where a chunk download currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Published but no work done yet
    Pending,
    /// Waiting for a replacement URL from the server
    RefreshingUrl,
    /// The HTTP transfer is running
    Running,
    Completed,
    Failed,
}

const STATE_PENDING: u8 = 0;
const STATE_REFRESHING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_COMPLETED: u8 = 3;
const STATE_FAILED: u8 = 4;

#[derive(Debug)]
struct Progress {
    state: AtomicU8,
    refresh_attempts: AtomicUsize,
}

impl Progress {
    fn set(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    fn get(&self) -> DownloadState {
        match self.state.load(Ordering::SeqCst) {
            STATE_PENDING => DownloadState::Pending,
            STATE_REFRESHING => DownloadState::RefreshingUrl,
            STATE_RUNNING => DownloadState::Running,
            STATE_COMPLETED => DownloadState::Completed,
            _ => DownloadState::Failed,
        }
    }
}

/// The downloaded and decompressed content of one chunk
///
/// Holds the byte-budget reservation and the parallelism permit of the
/// chunk. Dropping the payload returns both, so a fully drained chunk
/// frees its resources exactly once, on drop.
#[derive(Debug)]
pub struct ChunkPayload {
    meta: ChunkMeta,
    bytes: Bytes,
    _reservation: BudgetReservation,
    _slot: Option<OwnedSemaphorePermit>,
}

impl ChunkPayload {
    pub(crate) fn new(
        meta: ChunkMeta,
        bytes: Bytes,
        reservation: BudgetReservation,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            meta,
            bytes,
            _reservation: reservation,
            _slot: slot,
        }
    }

    pub fn meta(&self) -> ChunkMeta {
        self.meta
    }

    /// The Arrow IPC bytes of this chunk. Cloning is cheap.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

/// The promise for one in-flight chunk
#[derive(Debug)]
pub struct DownloadResult {
    meta: ChunkMeta,
    progress: Arc<Progress>,
    outcome: oneshot::Receiver<Result<ChunkPayload, CloudFetchError>>,
}

impl DownloadResult {
    pub fn meta(&self) -> ChunkMeta {
        self.meta
    }

    pub fn state(&self) -> DownloadState {
        self.progress.get()
    }

    /// How often the URL of this chunk was replaced.
    pub fn refresh_attempts(&self) -> usize {
        self.progress.refresh_attempts.load(Ordering::SeqCst)
    }

    /// Waits for the download to finish and returns the payload.
    ///
    /// A download abandoned by cancellation resolves to a cancelled
    /// error.
    pub async fn wait(self) -> Result<ChunkPayload, CloudFetchError> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CloudFetchError::new_cancelled()),
        }
    }
}

/// The task-side handle resolving a [DownloadResult]
#[derive(Debug)]
pub(crate) struct ChunkCompletion {
    progress: Arc<Progress>,
    tx: oneshot::Sender<Result<ChunkPayload, CloudFetchError>>,
}

impl ChunkCompletion {
    pub fn mark_running(&self) {
        self.progress.set(STATE_RUNNING);
    }

    pub fn mark_refreshing(&self) {
        self.progress.set(STATE_REFRESHING);
        self.progress.refresh_attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// How often this chunk's URL was replaced so far.
    pub fn refresh_attempts(&self) -> usize {
        self.progress.refresh_attempts.load(Ordering::SeqCst)
    }

    pub fn complete(self, payload: ChunkPayload) {
        self.progress.set(STATE_COMPLETED);
        let _ = self.tx.send(Ok(payload));
    }

    pub fn fail(self, err: CloudFetchError) {
        self.progress.set(STATE_FAILED);
        let _ = self.tx.send(Err(err));
    }
}

/// Creates the linked promise/completion pair for one descriptor.
pub(crate) fn download_result_pair(meta: ChunkMeta) -> (DownloadResult, ChunkCompletion) {
    let progress = Arc::new(Progress {
        state: AtomicU8::new(STATE_PENDING),
        refresh_attempts: AtomicUsize::new(0),
    });
    let (tx, outcome) = oneshot::channel();

    let result = DownloadResult {
        meta,
        progress: Arc::clone(&progress),
        outcome,
    };
    let completion = ChunkCompletion { progress, tx };

    (result, completion)
}

/// An element of the result queue
#[derive(Debug)]
pub enum ResultItem {
    Chunk(DownloadResult),
    /// No further chunks will be published
    EndOfResults,
}
