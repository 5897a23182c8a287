//! # CloudFetch
//!
//! ## Overview
//!
//! CloudFetch streams large SQL result sets whose chunks live in cloud
//! storage: the server hands out presigned URLs to per-chunk Arrow IPC
//! files instead of sending rows inline, and this crate downloads
//! those chunks concurrently and delivers the decoded record batches
//! strictly in chunk order.
//!
//! The pipeline has three cooperating stages:
//!
//! * a [ResultFetcher](fetch::ResultFetcher) pulls chunk descriptors
//!   from the server and refreshes expired URLs on demand
//! * the downloader turns descriptors into bounded concurrent
//!   transfers, throttled by a byte budget and a parallelism limit
//! * the [CloudFetchReader](reader::CloudFetchReader) decodes the
//!   completed chunks into record batches
//!
//! This crate provides the protocol-agnostic core only. The fetcher
//! variants live in their own crates:
//!
//! * `cloudfetch_thrift` for servers speaking the Thrift
//!   `FetchResults` RPC
//! * `cloudfetch_rest` for the REST statement execution API
//!
//! ## Wording
//!
//! * `Chunk`: one Arrow IPC file in cloud storage holding a slice of
//!   the result rows
//! * `Descriptor`: the per-chunk metadata the server returns (URL, row
//!   offset, row count, byte count, expiry)
//! * `Prefetch`: downloading chunks ahead of the consumer
//! * `Byte budget`: the bounded pool of bytes reserved for in-memory
//!   chunk buffers
//!
//! ## Backpressure
//!
//! Two independent knobs bound the pipeline: the byte budget (default
//! 200 MiB) and the number of parallel downloads (default 3). They are
//! deliberately not merged into one credit; a single credit in bytes
//! over-throttles small chunks and a single credit in slots ignores
//! memory entirely.
use std::sync::Arc;

use anyhow::Error as AnyError;
use arrow_schema::SchemaRef;

use clock::{Clock, SystemClock};
use config::Config;
use errors::CloudFetchError;
use fetch::ResultFetcher;
use reader::CloudFetchReader;
use storage_client::{HttpStorageClient, StorageClient};

#[macro_use]
pub(crate) mod helpers;
pub mod budget;
pub mod clock;
pub mod config;
pub mod descriptor;
pub mod download;
pub mod errors;
pub mod fetch;
mod machinery;
pub mod reader;
pub mod storage_client;
pub mod streams;

pub use machinery::{DownloadManager, PipelineControl};

#[cfg(test)]
pub mod test_utils;

/// Statement-level facts the pipeline needs from the execution layer
#[derive(Debug, Clone, Default)]
pub struct ResultSetInfo {
    /// Whether the server announced LZ4 compressed chunk files
    pub lz4_compressed: bool,
    /// The manifest schema, required to answer schema queries on an
    /// empty result set
    pub schema: Option<SchemaRef>,
}

impl ResultSetInfo {
    pub fn lz4_compressed(mut self, v: bool) -> Self {
        self.lz4_compressed = v;
        self
    }

    pub fn schema(mut self, schema: SchemaRef) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// The entry point of the pipeline
///
/// Holds the validated [Config] and the storage client, and opens one
/// [CloudFetchReader] per executed statement.
pub struct CloudFetch {
    storage: Arc<dyn StorageClient>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl CloudFetch {
    /// Creates the pipeline entry point with an HTTP storage client.
    ///
    /// Fails if the [Config] is not valid.
    pub fn new(config: Config) -> Result<Self, AnyError> {
        let config = config.validated()?;
        let storage = HttpStorageClient::new(config.http_timeout.into_duration())?;
        Ok(Self {
            storage: Arc::new(storage),
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Creates the pipeline entry point with a custom storage client.
    pub fn with_storage(config: Config, storage: Arc<dyn StorageClient>) -> Result<Self, AnyError> {
        let config = config.validated()?;
        Ok(Self {
            storage,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Replaces the clock. Only expiry checks consult it.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the pipeline for one statement and returns its reader.
    pub fn open_reader(
        &self,
        fetcher: Arc<dyn ResultFetcher>,
        result_set: ResultSetInfo,
    ) -> Result<CloudFetchReader, CloudFetchError> {
        let manager = DownloadManager::start(
            fetcher,
            Arc::clone(&self.storage),
            Arc::clone(&self.clock),
            &self.config,
            result_set.lz4_compressed,
        )?;
        Ok(CloudFetchReader::new(manager, result_set.schema))
    }
}
