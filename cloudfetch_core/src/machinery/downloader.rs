//! Turns enqueued descriptors into completed chunks
//!
//! The driver consumes the descriptor queue strictly in order. For
//! every descriptor it acquires a parallelism slot, then the byte
//! budget, publishes the still-pending [DownloadResult] to the result
//! queue and only then spawns the task that actually transfers the
//! bytes. Publication order therefore equals descriptor order, no
//! matter in which order the transfers finish.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::budget::{BudgetReservation, ByteBudget};
use crate::clock::Clock;
use crate::config::Config;
use crate::descriptor::ChunkDescriptor;
use crate::download::{download_result_pair, ChunkCompletion, ChunkPayload, ResultItem};
use crate::errors::CloudFetchError;
use crate::fetch::{FetchItem, ResultFetcher};
use crate::machinery::{BufferPool, PipelineControl};
use crate::storage_client::StorageClient;

/// The consumer end of the result queue
pub(crate) struct Downloader {
    results: mpsc::Receiver<ResultItem>,
    control: PipelineControl,
    budget: ByteBudget,
    slots: Arc<Semaphore>,
}

impl Downloader {
    /// Pops the next chunk in descriptor order and waits for its
    /// download to finish.
    ///
    /// Returns `None` after the last chunk. Once the pipeline is in
    /// the terminal error state every call returns that error.
    pub async fn next(&mut self) -> Result<Option<ChunkPayload>, CloudFetchError> {
        if let Some(err) = self.control.error() {
            return Err(err);
        }

        let item = tokio::select! {
            _ = self.control.cancelled() => {
                return match self.control.error() {
                    Some(err) => Err(err),
                    None => Err(CloudFetchError::new_cancelled()),
                };
            }
            item = self.results.recv() => item,
        };

        match item {
            Some(ResultItem::Chunk(result)) => match result.wait().await {
                Ok(payload) => Ok(Some(payload)),
                Err(err) if err.is_cancelled() => {
                    // the task was torn down; surface the root cause if
                    // another stage recorded one
                    match self.control.error() {
                        Some(root) => Err(root),
                        None => Err(err),
                    }
                }
                Err(err) => Err(err),
            },
            Some(ResultItem::EndOfResults) | None => match self.control.error() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Drops everything still queued, releasing held resources.
    pub fn drain(&mut self) {
        while self.results.try_recv().is_ok() {}
    }

    pub fn budget(&self) -> &ByteBudget {
        &self.budget
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Starts the driver for the given descriptor queue.
pub(crate) fn start(
    descriptors: mpsc::Receiver<FetchItem>,
    fetcher: Arc<dyn ResultFetcher>,
    storage: Arc<dyn StorageClient>,
    clock: Arc<dyn Clock>,
    config: &Config,
    lz4_compressed: bool,
    control: PipelineControl,
) -> (Downloader, JoinHandle<()>) {
    let budget = ByteBudget::new(config.memory_buffer_mib.into_bytes());
    let slots = Arc::new(Semaphore::new(config.parallel_downloads.into_inner()));
    let (result_tx, result_rx) = mpsc::channel(config.queue_capacity());

    let driver = DriverContext {
        fetcher,
        storage,
        clock,
        control: control.clone(),
        budget: budget.clone(),
        slots: Arc::clone(&slots),
        pool: BufferPool::new(config.parallel_downloads.into_inner()),
        tuning: ChunkTuning::from_config(config),
        lz4_compressed,
    };

    let task = tokio::spawn(drive(descriptors, result_tx, driver));

    let downloader = Downloader {
        results: result_rx,
        control,
        budget,
        slots,
    };

    (downloader, task)
}

#[derive(Debug, Clone, Copy)]
struct ChunkTuning {
    expiry_buffer: Duration,
    max_retries: usize,
    max_url_refresh_attempts: usize,
    retry_delay: Duration,
}

impl ChunkTuning {
    fn from_config(config: &Config) -> Self {
        Self {
            expiry_buffer: config.url_expiration_buffer.into_duration(),
            max_retries: config.max_retries.into_inner(),
            max_url_refresh_attempts: config.max_url_refresh_attempts.into_inner(),
            retry_delay: config.retry_delay.into_duration(),
        }
    }
}

struct DriverContext {
    fetcher: Arc<dyn ResultFetcher>,
    storage: Arc<dyn StorageClient>,
    clock: Arc<dyn Clock>,
    control: PipelineControl,
    budget: ByteBudget,
    slots: Arc<Semaphore>,
    pool: BufferPool,
    tuning: ChunkTuning,
    lz4_compressed: bool,
}

async fn drive(
    mut descriptors: mpsc::Receiver<FetchItem>,
    results: mpsc::Sender<ResultItem>,
    ctx: DriverContext,
) {
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        let item = tokio::select! {
            _ = ctx.control.cancelled() => break,
            item = descriptors.recv() => item,
        };

        let descriptor = match item {
            Some(FetchItem::Chunk(descriptor)) => descriptor,
            Some(FetchItem::EndOfResults) | None => {
                // a fetcher that died without the sentinel has already
                // failed the pipeline; a sent sentinel is a clean end
                tokio::select! {
                    _ = ctx.control.cancelled() => {}
                    _ = results.send(ResultItem::EndOfResults) => {}
                }
                break;
            }
        };

        while tasks.try_join_next().is_some() {}

        debug!(
            chunk_index = descriptor.meta.chunk_index,
            byte_count = descriptor.meta.byte_count,
            "dispatching chunk"
        );

        // slot before budget: the slot is cheap, the budget is the
        // scarce resource
        let slot = tokio::select! {
            _ = ctx.control.cancelled() => break,
            permit = Arc::clone(&ctx.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            }
        };

        let reservation = tokio::select! {
            _ = ctx.control.cancelled() => break,
            reservation = ctx.budget.acquire(descriptor.meta.byte_count) => match reservation {
                Ok(reservation) => reservation,
                Err(_) => break,
            }
        };

        // publish before the transfer starts so output order equals
        // descriptor order
        let (result, completion) = download_result_pair(descriptor.meta);
        let published = tokio::select! {
            _ = ctx.control.cancelled() => false,
            sent = results.send(ResultItem::Chunk(result)) => sent.is_ok(),
        };
        if !published {
            break;
        }

        tasks.spawn(run_chunk(ChunkTask {
            descriptor,
            slot,
            reservation,
            completion,
            fetcher: Arc::clone(&ctx.fetcher),
            storage: Arc::clone(&ctx.storage),
            clock: Arc::clone(&ctx.clock),
            control: ctx.control.clone(),
            pool: ctx.pool.clone(),
            tuning: ctx.tuning,
            lz4_compressed: ctx.lz4_compressed,
        }));
    }

    while tasks.join_next().await.is_some() {}
}

struct ChunkTask {
    descriptor: ChunkDescriptor,
    slot: OwnedSemaphorePermit,
    reservation: BudgetReservation,
    completion: ChunkCompletion,
    fetcher: Arc<dyn ResultFetcher>,
    storage: Arc<dyn StorageClient>,
    clock: Arc<dyn Clock>,
    control: PipelineControl,
    pool: BufferPool,
    tuning: ChunkTuning,
    lz4_compressed: bool,
}

enum ChunkAbort {
    /// Torn down by cancellation, not an error surface
    Cancelled,
    Failed(CloudFetchError),
}

async fn run_chunk(task: ChunkTask) {
    let ChunkTask {
        mut descriptor,
        slot,
        reservation,
        completion,
        fetcher,
        storage,
        clock,
        control,
        pool,
        tuning,
        lz4_compressed,
    } = task;

    let meta = descriptor.meta;

    let outcome = fetch_chunk(
        &mut descriptor,
        &completion,
        fetcher.as_ref(),
        storage.as_ref(),
        clock.as_ref(),
        &control,
        &pool,
        tuning,
        lz4_compressed,
    )
    .await;

    match outcome {
        Ok(bytes) => {
            debug!(
                chunk_index = meta.chunk_index,
                bytes = bytes.len(),
                "chunk completed"
            );
            completion.complete(ChunkPayload::new(meta, bytes, reservation, Some(slot)));
        }
        Err(ChunkAbort::Cancelled) => {
            debug!(chunk_index = meta.chunk_index, "chunk aborted by cancellation");
            // dropping the completion resolves waiters with `Cancelled`;
            // dropping slot and reservation returns the resources
        }
        Err(ChunkAbort::Failed(err)) => {
            error!(chunk_index = meta.chunk_index, error = %err, "chunk download failed");
            control.fail(err.clone());
            completion.fail(err);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_chunk(
    descriptor: &mut ChunkDescriptor,
    completion: &ChunkCompletion,
    fetcher: &dyn ResultFetcher,
    storage: &dyn StorageClient,
    clock: &dyn Clock,
    control: &PipelineControl,
    pool: &BufferPool,
    tuning: ChunkTuning,
    lz4_compressed: bool,
) -> Result<Bytes, ChunkAbort> {
    if descriptor
        .link
        .expires_within(clock.now(), tuning.expiry_buffer)
    {
        debug!(
            chunk_index = descriptor.meta.chunk_index,
            "URL expires soon, refreshing before download"
        );
        refresh_link(descriptor, completion, fetcher, control).await?;
    }

    let mut failed_attempts = 0;
    loop {
        if control.token().is_cancelled() {
            return Err(ChunkAbort::Cancelled);
        }

        completion.mark_running();

        let response = storage
            .get(
                &descriptor.link.url,
                &descriptor.link.http_headers,
                control.token(),
            )
            .await;

        let err = match response {
            Ok(bytes) => {
                return if lz4_compressed {
                    decompress(bytes, pool).await.map_err(ChunkAbort::Failed)
                } else {
                    Ok(bytes)
                };
            }
            Err(err) => err,
        };

        if err.is_cancelled() {
            return Err(ChunkAbort::Cancelled);
        }

        if err.is_expired_signature() {
            // recovered by a server roundtrip, never by local backoff,
            // and does not consume a generic retry
            if completion.refresh_attempts() >= tuning.max_url_refresh_attempts {
                return Err(ChunkAbort::Failed(CloudFetchError::new_download_failed(
                    format!(
                        "chunk {}: URL still rejected after {} refreshes: {}",
                        descriptor.meta.chunk_index,
                        completion.refresh_attempts(),
                        err
                    ),
                )));
            }
            warn!(
                chunk_index = descriptor.meta.chunk_index,
                error = %err,
                "storage rejected the URL, requesting a fresh one"
            );
            refresh_link(descriptor, completion, fetcher, control).await?;
            continue;
        }

        failed_attempts += 1;
        if failed_attempts >= tuning.max_retries {
            return Err(ChunkAbort::Failed(CloudFetchError::new_download_failed(
                format!(
                    "chunk {}: giving up after {} attempts: {}",
                    descriptor.meta.chunk_index, failed_attempts, err
                ),
            )));
        }

        let backoff = tuning.retry_delay * failed_attempts as u32;
        warn!(
            chunk_index = descriptor.meta.chunk_index,
            attempt = failed_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "chunk download attempt failed, backing off"
        );
        tokio::select! {
            _ = control.cancelled() => return Err(ChunkAbort::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Replaces the descriptor's link with a fresh one from the server.
///
/// Fails the chunk permanently if the server has no replacement for
/// this offset.
async fn refresh_link(
    descriptor: &mut ChunkDescriptor,
    completion: &ChunkCompletion,
    fetcher: &dyn ResultFetcher,
    control: &PipelineControl,
) -> Result<(), ChunkAbort> {
    completion.mark_refreshing();

    let offset = descriptor.meta.start_row_offset;
    let refreshed = tokio::select! {
        _ = control.cancelled() => return Err(ChunkAbort::Cancelled),
        refreshed = fetcher.refresh(offset, control.token()) => refreshed,
    }
    .map_err(ChunkAbort::Failed)?;

    match refreshed
        .into_iter()
        .find(|d| d.meta.start_row_offset == offset)
    {
        Some(replacement) => {
            descriptor.link = replacement.link;
            Ok(())
        }
        None => Err(ChunkAbort::Failed(CloudFetchError::new_download_failed(
            format!(
                "chunk {}: URL refresh returned no replacement for row offset {}",
                descriptor.meta.chunk_index, offset
            ),
        ))),
    }
}

async fn decompress(input: Bytes, pool: &BufferPool) -> Result<Bytes, CloudFetchError> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let mut scratch = pool.take();
        let mut decoder = lz4_flex::frame::FrameDecoder::new(&input[..]);
        let result = decoder
            .read_to_end(&mut scratch)
            .map(|_| Bytes::copy_from_slice(&scratch))
            .map_err(|err| {
                CloudFetchError::new_decompression(format!("lz4 frame decode failed: {err}"))
            });
        pool.give_back(scratch);
        result
    })
    .await
    .map_err(|err| CloudFetchError::new_decompression(format!("decompression task died: {err}")))?
}
