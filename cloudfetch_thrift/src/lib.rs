//! # CloudFetch over Thrift
//!
//! Fetches chunk descriptors through the Thrift `FetchResults` RPC.
//!
//! The actual Thrift channel stays outside this crate: anything that
//! can answer a [FetchResultsRequest] implements [FetchResultsService]
//! and plugs into the pipeline.
//!
//! ```rust, ignore
//! use std::sync::Arc;
//!
//! use cloudfetch_thrift::*;
//! use cloudfetch_core::config::Config;
//!
//! # async {
//! let service: Arc<dyn FetchResultsService> = my_thrift_channel();
//! let fetcher = Arc::new(ThriftResultFetcher::new(service, &Config::default()));
//!
//! let cloudfetch = CloudFetch::new(Config::default()).unwrap();
//! let reader = cloudfetch.open_reader(fetcher, ResultSetInfo::default()).unwrap();
//! # };
//! # ()
//! ```
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cloudfetch_core::config::Config;
use cloudfetch_core::descriptor::{ChunkDescriptor, ChunkLink, ChunkMeta};
use cloudfetch_core::errors::CloudFetchError;
use cloudfetch_core::fetch::{enqueue, FetchItem, FetchState, ResultFetcher};
use cloudfetch_core::PipelineControl;

pub use cloudfetch_core::*;

/// Rows requested per `FetchResults` call.
const DEFAULT_BATCH_SIZE: u64 = 100_000;

/// Cursor direction of a `FetchResults` call
///
/// Only forward iteration is used; the server keeps the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrientation {
    Next,
}

/// One `FetchResults` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResultsRequest {
    pub orientation: FetchOrientation,
    pub max_rows: u64,
    /// Always set, even when 0. The server treats an unset offset
    /// differently from an explicit 0.
    pub start_row_offset: u64,
}

/// One presigned result file as the Thrift protocol describes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrowResultLink {
    pub file_link: String,
    pub start_row_offset: u64,
    pub row_count: u64,
    pub bytes_num: u64,
    /// Unix epoch milliseconds
    pub expiry_time_ms: i64,
    pub http_headers: Vec<(String, String)>,
}

/// The interesting part of a `FetchResults` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResultsResponse {
    pub result_links: Vec<ArrowResultLink>,
    pub has_more_rows: bool,
}

/// A failed RPC against the server
#[derive(Error, Debug)]
#[error("fetch results rpc failed: {0}")]
pub struct FetchResultsError(pub String);

/// The Thrift channel the fetcher talks through
///
/// Implemented by the session layer owning the operation handle.
#[async_trait]
pub trait FetchResultsService: Send + Sync + 'static {
    async fn fetch_results(
        &self,
        request: FetchResultsRequest,
    ) -> Result<FetchResultsResponse, FetchResultsError>;
}

/// Descriptors the server returned together with query execution
///
/// Emitting them first saves the initial `FetchResults` round trip.
#[derive(Debug, Clone, Default)]
pub struct InitialResults {
    pub links: Vec<ArrowResultLink>,
    pub has_more_rows: bool,
}

/// [ResultFetcher] over the Thrift `FetchResults` RPC
pub struct ThriftResultFetcher {
    service: Arc<dyn FetchResultsService>,
    state: Arc<FetchState>,
    batch_size: u64,
    query_timeout: Duration,
    initial: Mutex<Option<InitialResults>>,
}

impl ThriftResultFetcher {
    pub fn new(service: Arc<dyn FetchResultsService>, config: &Config) -> Self {
        Self {
            service,
            state: Arc::new(FetchState::new()),
            batch_size: DEFAULT_BATCH_SIZE,
            query_timeout: config.query_timeout.into_duration(),
            initial: Mutex::new(None),
        }
    }

    /// Rows requested per `FetchResults` call.
    pub fn batch_size(mut self, rows: u64) -> Self {
        self.batch_size = rows;
        self
    }

    /// Seeds the fetcher with links already returned at execution time.
    pub fn with_initial_results(self, initial: InitialResults) -> Self {
        *self.initial.lock().unwrap() = Some(initial);
        self
    }
}

/// Issues one `FetchResults` call bounded by the query timeout.
async fn call_server(
    service: &dyn FetchResultsService,
    batch_size: u64,
    query_timeout: Duration,
    start_row_offset: u64,
    cancel: &CancellationToken,
) -> Result<FetchResultsResponse, CloudFetchError> {
    let request = FetchResultsRequest {
        orientation: FetchOrientation::Next,
        max_rows: batch_size,
        start_row_offset,
    };

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(CloudFetchError::new_cancelled()),
        response = tokio::time::timeout(query_timeout, service.fetch_results(request)) => response,
    };

    match response {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(CloudFetchError::new_server_fetch(err.to_string())),
        Err(_) => Err(CloudFetchError::new_server_fetch(format!(
            "FetchResults timed out after {query_timeout:?}"
        ))),
    }
}

/// Converts a wire link into a descriptor with a fresh client index.
///
/// Call only while the RPC gate is held: the URL cache is updated as a
/// side effect.
fn descriptor_from_link(
    state: &FetchState,
    link: ArrowResultLink,
) -> Result<ChunkDescriptor, CloudFetchError> {
    let expiry = DateTime::from_timestamp_millis(link.expiry_time_ms).ok_or_else(|| {
        CloudFetchError::new_server_fetch(format!(
            "link for row offset {} carries an invalid expiry: {}",
            link.start_row_offset, link.expiry_time_ms
        ))
    })?;

    let chunk_link = ChunkLink::new(link.file_link, expiry).with_headers(link.http_headers);
    state.remember_link(link.start_row_offset, chunk_link.clone(), None);

    Ok(ChunkDescriptor::new(
        ChunkMeta {
            chunk_index: state.next_index(),
            start_row_offset: link.start_row_offset,
            row_count: link.row_count,
            byte_count: link.bytes_num,
        },
        chunk_link,
    ))
}

#[async_trait]
impl ResultFetcher for ThriftResultFetcher {
    fn start(
        &self,
        queue: mpsc::Sender<FetchItem>,
        control: PipelineControl,
    ) -> Result<JoinHandle<()>, CloudFetchError> {
        self.state.try_start()?;

        let state = Arc::clone(&self.state);
        let service = Arc::clone(&self.service);
        let batch_size = self.batch_size;
        let query_timeout = self.query_timeout;
        let initial = self.initial.lock().unwrap().take();

        Ok(tokio::spawn(async move {
            let mut next_offset = 0u64;
            let mut has_more = true;

            if let Some(initial) = initial {
                debug!(
                    links = initial.links.len(),
                    "emitting initial results without an RPC"
                );
                has_more = initial.has_more_rows;

                let descriptors = {
                    let _gate = state.rpc_gate().lock().await;
                    let mut out = Vec::with_capacity(initial.links.len());
                    for link in initial.links {
                        match descriptor_from_link(&state, link) {
                            Ok(descriptor) => out.push(descriptor),
                            Err(err) => {
                                state.fail(err.clone());
                                control.fail(err);
                                return;
                            }
                        }
                    }
                    out
                };

                for descriptor in descriptors {
                    next_offset = descriptor.meta.end_row_offset();
                    if enqueue(&queue, FetchItem::Chunk(descriptor), control.token())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }

            while has_more {
                let descriptors = {
                    let _gate = state.rpc_gate().lock().await;
                    let response = match call_server(
                        service.as_ref(),
                        batch_size,
                        query_timeout,
                        next_offset,
                        control.token(),
                    )
                    .await
                    {
                        Ok(response) => response,
                        Err(err) if err.is_cancelled() => return,
                        Err(err) => {
                            state.fail(err.clone());
                            control.fail(err);
                            return;
                        }
                    };

                    has_more = response.has_more_rows;
                    if response.result_links.is_empty() && has_more {
                        warn!("server reported more rows but returned no links, stopping");
                        has_more = false;
                    }

                    let mut out = Vec::with_capacity(response.result_links.len());
                    for link in response.result_links {
                        match descriptor_from_link(&state, link) {
                            Ok(descriptor) => out.push(descriptor),
                            Err(err) => {
                                state.fail(err.clone());
                                control.fail(err);
                                return;
                            }
                        }
                    }
                    out
                };

                for descriptor in descriptors {
                    next_offset = descriptor.meta.end_row_offset();
                    if enqueue(&queue, FetchItem::Chunk(descriptor), control.token())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }

            let _ = enqueue(&queue, FetchItem::EndOfResults, control.token()).await;
            state.finish();
        }))
    }

    async fn refresh(
        &self,
        start_row_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkDescriptor>, CloudFetchError> {
        let _gate = self.state.rpc_gate().lock().await;

        debug!(start_row_offset, "refreshing links");
        let response = match call_server(
            self.service.as_ref(),
            self.batch_size,
            self.query_timeout,
            start_row_offset,
            cancel,
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                if !err.is_cancelled() {
                    self.state.fail(err.clone());
                }
                return Err(err);
            }
        };

        let mut out = Vec::with_capacity(response.result_links.len());
        for link in response.result_links {
            out.push(descriptor_from_link(&self.state, link)?);
        }
        Ok(out)
    }

    fn has_more_results(&self) -> bool {
        self.state.has_more_results()
    }

    fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    fn last_error(&self) -> Option<CloudFetchError> {
        self.state.last_error()
    }
}
