//! The fetcher side of the pipeline
//!
//! A fetcher pulls chunk descriptors from the server and feeds them to
//! the downloader in chunk-index order. The two protocol variants
//! (Thrift `FetchResults` and the REST statement execution API) have
//! disjoint state but share this capability set and the bookkeeping in
//! [FetchState].
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::descriptor::{ChunkDescriptor, ChunkLink};
use crate::errors::CloudFetchError;
use crate::machinery::PipelineControl;

/// An element of the descriptor queue
#[derive(Debug, Clone)]
pub enum FetchItem {
    Chunk(ChunkDescriptor),
    /// The server reported that no further chunks exist
    EndOfResults,
}

/// The capability set shared by all fetcher variants
#[async_trait]
pub trait ResultFetcher: Send + Sync + 'static {
    /// Launches the background task that feeds `queue` with
    /// descriptors in chunk-index order, terminated by
    /// [FetchItem::EndOfResults].
    ///
    /// At most one task may be started per fetcher. A second call
    /// fails with an invalid-state error.
    fn start(
        &self,
        queue: mpsc::Sender<FetchItem>,
        control: PipelineControl,
    ) -> Result<JoinHandle<()>, CloudFetchError>;

    /// Requests fresh descriptors anchored at `start_row_offset`.
    ///
    /// Returns the replacement for that offset and whatever adjacent
    /// descriptors the server chose to include. Serializes against the
    /// background task: the server-side cursor must never see
    /// interleaved calls.
    async fn refresh(
        &self,
        start_row_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkDescriptor>, CloudFetchError>;

    /// `false` once the server reported the end of the result set or
    /// the fetcher failed.
    fn has_more_results(&self) -> bool;

    /// `true` once the background task finished, successfully or not.
    fn is_completed(&self) -> bool;

    /// The error that terminated this fetcher, if any.
    fn last_error(&self) -> Option<CloudFetchError>;
}

/// Sends `item` to the descriptor queue, giving up on cancellation.
pub async fn enqueue(
    queue: &mpsc::Sender<FetchItem>,
    item: FetchItem,
    cancel: &CancellationToken,
) -> Result<(), CloudFetchError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CloudFetchError::new_cancelled()),
        sent = queue.send(item) => sent.map_err(|_| CloudFetchError::new_cancelled()),
    }
}

#[derive(Debug, Clone)]
struct CachedLink {
    link: ChunkLink,
    /// Chunk index under which the server knows this offset, where the
    /// protocol exposes one. Client-side chunk indices keep counting
    /// independently.
    remote_index: Option<u64>,
}

/// Bookkeeping shared by the fetcher variants
///
/// Owns the RPC gate (one outstanding server call at a time), the
/// offset-keyed URL cache and the monotone chunk-index sequence.
/// The cache must only be mutated while the gate is held.
#[derive(Debug)]
pub struct FetchState {
    rpc_gate: tokio::sync::Mutex<()>,
    cache: Mutex<BTreeMap<u64, CachedLink>>,
    next_chunk_index: AtomicU64,
    started: AtomicBool,
    has_more: AtomicBool,
    completed: AtomicBool,
    error: Mutex<Option<CloudFetchError>>,
}

impl FetchState {
    pub fn new() -> Self {
        Self {
            rpc_gate: tokio::sync::Mutex::new(()),
            cache: Mutex::new(BTreeMap::new()),
            next_chunk_index: AtomicU64::new(0),
            started: AtomicBool::new(false),
            has_more: AtomicBool::new(true),
            completed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Marks the fetcher as started.
    ///
    /// Fails if it already was.
    pub fn try_start(&self) -> Result<(), CloudFetchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            Err(CloudFetchError::new_invalid_state(
                "fetcher was already started",
            ))
        } else {
            Ok(())
        }
    }

    /// The gate serializing server calls.
    pub fn rpc_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.rpc_gate
    }

    /// Hands out the next client-side chunk index.
    ///
    /// Monotone across the fetcher's lifetime, including indices
    /// assigned to refreshed descriptors.
    pub fn next_index(&self) -> u64 {
        self.next_chunk_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Records the latest known link for an offset.
    ///
    /// Call only while the RPC gate is held.
    pub fn remember_link(&self, offset: u64, link: ChunkLink, remote_index: Option<u64>) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(offset, CachedLink { link, remote_index });
    }

    pub fn cached_link(&self, offset: u64) -> Option<ChunkLink> {
        let cache = self.cache.lock().unwrap();
        cache.get(&offset).map(|c| c.link.clone())
    }

    pub fn cached_remote_index(&self, offset: u64) -> Option<u64> {
        let cache = self.cache.lock().unwrap();
        cache.get(&offset).and_then(|c| c.remote_index)
    }

    /// Terminates the fetcher with an error. The first error wins.
    pub fn fail(&self, err: CloudFetchError) {
        {
            let mut slot = self.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.has_more.store(false, Ordering::SeqCst);
        self.completed.store(true, Ordering::SeqCst);
    }

    /// Terminates the fetcher cleanly.
    pub fn finish(&self) {
        self.has_more.store(false, Ordering::SeqCst);
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn has_more_results(&self) -> bool {
        self.has_more.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<CloudFetchError> {
        self.error.lock().unwrap().clone()
    }
}

impl Default for FetchState {
    fn default() -> Self {
        Self::new()
    }
}
