//! Orchestration of fetcher and downloader
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::config::Config;
use crate::download::ChunkPayload;
use crate::errors::CloudFetchError;
use crate::fetch::ResultFetcher;
use crate::machinery::{downloader, Downloader, PipelineControl};
use crate::storage_client::StorageClient;

/// Wires a fetcher and the downloader into one pipeline
///
/// Owns the cancellation token and the background tasks. The consumer
/// interface is a single ordered [DownloadManager::next].
pub struct DownloadManager {
    control: PipelineControl,
    fetcher: Arc<dyn ResultFetcher>,
    downloader: Downloader,
    fetch_task: Option<JoinHandle<()>>,
    driver_task: Option<JoinHandle<()>>,
    stopped: bool,
}

impl DownloadManager {
    /// Starts both background stages.
    ///
    /// `lz4_compressed` states whether the server announced LZ4
    /// compressed chunk files for this statement.
    pub fn start(
        fetcher: Arc<dyn ResultFetcher>,
        storage: Arc<dyn StorageClient>,
        clock: Arc<dyn Clock>,
        config: &Config,
        lz4_compressed: bool,
    ) -> Result<Self, CloudFetchError> {
        let control = PipelineControl::new();

        let (descriptor_tx, descriptor_rx) = mpsc::channel(config.queue_capacity());
        let fetch_task = fetcher.start(descriptor_tx, control.clone())?;

        let (downloader, driver_task) = downloader::start(
            descriptor_rx,
            Arc::clone(&fetcher),
            storage,
            clock,
            config,
            lz4_compressed,
            control.clone(),
        );

        Ok(Self {
            control,
            fetcher,
            downloader,
            fetch_task: Some(fetch_task),
            driver_task: Some(driver_task),
            stopped: false,
        })
    }

    /// The next chunk in order, or `None` after the last one.
    ///
    /// When the pipeline failed, the downloader error is returned with
    /// the fetcher error attached if one exists as well.
    pub async fn next(&mut self) -> Result<Option<ChunkPayload>, CloudFetchError> {
        if self.stopped {
            return Err(CloudFetchError::new_invalid_state(
                "the download manager was already stopped",
            ));
        }

        match self.downloader.next().await {
            Ok(payload) => Ok(payload),
            Err(err) => Err(self.aggregate(err)),
        }
    }

    fn aggregate(&self, err: CloudFetchError) -> CloudFetchError {
        match self.fetcher.last_error() {
            Some(fetch_err) if fetch_err.to_string() != err.to_string() => {
                err.with_related(fetch_err)
            }
            _ => err,
        }
    }

    /// Stops the pipeline and releases every held resource.
    ///
    /// Does not return before both background tasks have observed the
    /// cancellation. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        debug!("stopping download manager");
        self.control.cancel();

        if let Some(task) = self.fetch_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.driver_task.take() {
            let _ = task.await;
        }

        self.downloader.drain();
    }

    /// The terminal error of the pipeline, if any.
    pub fn error(&self) -> Option<CloudFetchError> {
        self.control.error()
    }

    pub(crate) fn budget(&self) -> &crate::budget::ByteBudget {
        self.downloader.budget()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.downloader.free_slots()
    }

    pub(crate) fn control(&self) -> &PipelineControl {
        &self.control
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        // a dropped manager cannot await its tasks; cancelling is
        // enough, every task releases its resources on the way out
        self.control.cancel();
    }
}
