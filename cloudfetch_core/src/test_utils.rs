//! Fakes and builders for pipeline tests
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::descriptor::{ChunkDescriptor, ChunkLink, ChunkMeta};
use crate::errors::CloudFetchError;
use crate::fetch::{enqueue, FetchItem, FetchState, ResultFetcher};
use crate::machinery::PipelineControl;
use crate::storage_client::{StorageClient, StorageError};

/// A descriptor whose URL is valid for a long time.
pub fn descriptor(chunk_index: u64, start_row_offset: u64, row_count: u64, byte_count: u64, url: &str) -> ChunkDescriptor {
    let expiry = Utc::now() + ChronoDuration::hours(6);
    ChunkDescriptor::new(
        ChunkMeta {
            chunk_index,
            start_row_offset,
            row_count,
            byte_count,
        },
        ChunkLink::new(url, expiry),
    )
}

/// A descriptor whose URL already expired.
pub fn expired_descriptor(chunk_index: u64, start_row_offset: u64, row_count: u64, byte_count: u64, url: &str) -> ChunkDescriptor {
    let mut d = descriptor(chunk_index, start_row_offset, row_count, byte_count, url);
    d.link.expiry_time = Utc::now() - ChronoDuration::seconds(1);
    d
}

pub enum FetchEvent {
    Chunk(ChunkDescriptor),
    Fail(CloudFetchError),
}

/// A [ResultFetcher] playing back a fixed script
///
/// Refresh calls are recorded and answered from a queue of scripted
/// responses; an empty queue answers with no replacements.
pub struct ScriptedFetcher {
    state: Arc<FetchState>,
    script: Arc<Mutex<VecDeque<FetchEvent>>>,
    refresh_responses: Arc<Mutex<VecDeque<Result<Vec<ChunkDescriptor>, CloudFetchError>>>>,
    refresh_calls: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedFetcher {
    pub fn new<I: IntoIterator<Item = ChunkDescriptor>>(descriptors: I) -> Self {
        let script = descriptors.into_iter().map(FetchEvent::Chunk).collect();
        Self {
            state: Arc::new(FetchState::new()),
            script: Arc::new(Mutex::new(script)),
            refresh_responses: Arc::new(Mutex::new(VecDeque::new())),
            refresh_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Makes the fetcher fail after everything scripted so far.
    pub fn failing_with(self, err: CloudFetchError) -> Self {
        self.script.lock().unwrap().push_back(FetchEvent::Fail(err));
        self
    }

    /// Queues the answer for the next refresh call.
    pub fn push_refresh_response(&self, response: Vec<ChunkDescriptor>) {
        self.refresh_responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_refresh_error(&self, err: CloudFetchError) {
        self.refresh_responses.lock().unwrap().push_back(Err(err));
    }

    /// The row offsets refresh was called for, in call order.
    pub fn refresh_calls(&self) -> Vec<u64> {
        self.refresh_calls.lock().unwrap().clone()
    }

    /// Records a fetcher error without touching the pipeline, as a
    /// background RPC failure would.
    pub fn record_error(&self, err: CloudFetchError) {
        self.state.fail(err);
    }
}

#[async_trait]
impl ResultFetcher for ScriptedFetcher {
    fn start(
        &self,
        queue: mpsc::Sender<FetchItem>,
        control: PipelineControl,
    ) -> Result<JoinHandle<()>, CloudFetchError> {
        self.state.try_start()?;

        let state = Arc::clone(&self.state);
        let script = Arc::clone(&self.script);

        Ok(tokio::spawn(async move {
            loop {
                let event = script.lock().unwrap().pop_front();
                match event {
                    Some(FetchEvent::Chunk(descriptor)) => {
                        if enqueue(&queue, FetchItem::Chunk(descriptor), control.token())
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(FetchEvent::Fail(err)) => {
                        state.fail(err.clone());
                        control.fail(err);
                        return;
                    }
                    None => {
                        let _ = enqueue(&queue, FetchItem::EndOfResults, control.token()).await;
                        state.finish();
                        return;
                    }
                }
            }
        }))
    }

    async fn refresh(
        &self,
        start_row_offset: u64,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ChunkDescriptor>, CloudFetchError> {
        let _gate = self.state.rpc_gate().lock().await;
        self.refresh_calls.lock().unwrap().push(start_row_offset);
        match self.refresh_responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(Vec::new()),
        }
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

/// Lets a test hold a scripted response until it decides otherwise.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    pub fn open(&self) {
        self.0.add_permits(1);
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

enum StorageResponse {
    Ok(Bytes),
    Gated(Bytes, Gate),
    Status(u16),
    Transport(String),
    /// Blocks until the pipeline is cancelled
    Hang,
}

/// A [StorageClient] playing back per-URL scripts
///
/// Tracks the calls made and the maximum number of concurrently
/// running requests.
pub struct TestStorage {
    responses: Mutex<HashMap<String, VecDeque<StorageResponse>>>,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl TestStorage {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn push(&self, url: &str, response: StorageResponse) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_ok(&self, url: &str, bytes: Bytes) {
        self.push(url, StorageResponse::Ok(bytes));
    }

    pub fn push_gated(&self, url: &str, bytes: Bytes, gate: Gate) {
        self.push(url, StorageResponse::Gated(bytes, gate));
    }

    pub fn push_status(&self, url: &str, status: u16) {
        self.push(url, StorageResponse::Status(status));
    }

    pub fn push_transport_error(&self, url: &str, message: &str) {
        self.push(url, StorageResponse::Transport(message.to_string()));
    }

    pub fn push_hang(&self, url: &str) {
        self.push(url, StorageResponse::Hang);
    }

    /// All GETs issued so far, with their headers.
    pub fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// The largest number of GETs that ran at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl Default for TestStorage {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningGuard<'a>(&'a TestStorage);

impl<'a> RunningGuard<'a> {
    fn enter(storage: &'a TestStorage) -> Self {
        let now = storage.running.fetch_add(1, Ordering::SeqCst) + 1;
        storage.max_running.fetch_max(now, Ordering::SeqCst);
        Self(storage)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageClient for TestStorage {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Bytes, StorageError> {
        let _guard = RunningGuard::enter(self);

        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), headers.to_vec()));

        let response = self
            .responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);

        match response {
            Some(StorageResponse::Ok(bytes)) => Ok(bytes),
            Some(StorageResponse::Gated(bytes, gate)) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(StorageError::Cancelled),
                    permit = gate.0.acquire() => {
                        permit.expect("gate semaphore closed").forget();
                        Ok(bytes)
                    }
                }
            }
            Some(StorageResponse::Status(status)) => Err(StorageError::Status {
                status,
                message: String::new(),
            }),
            Some(StorageResponse::Transport(message)) => Err(StorageError::Transport(message)),
            Some(StorageResponse::Hang) => {
                cancel.cancelled().await;
                Err(StorageError::Cancelled)
            }
            None => Err(StorageError::Transport(format!(
                "no scripted response left for {url}"
            ))),
        }
    }
}

pub mod arrow {
    //! Arrow IPC payloads for tests
    use std::sync::Arc;

    use arrow_array::{ArrayRef, Int64Array, RecordBatch};
    use arrow_ipc::writer::StreamWriter;
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use bytes::Bytes;

    pub fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
    }

    pub fn batch(values: &[i64]) -> RecordBatch {
        let array: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
        RecordBatch::try_new(test_schema(), vec![array]).unwrap()
    }

    /// An IPC stream containing one batch per value slice.
    pub fn ipc_chunk(batches: &[&[i64]]) -> Bytes {
        let schema = test_schema();
        let mut writer = StreamWriter::try_new(Vec::new(), &schema).unwrap();
        for values in batches {
            writer.write(&batch(values)).unwrap();
        }
        writer.finish().unwrap();
        Bytes::from(writer.into_inner().unwrap())
    }

    /// An IPC stream with no batches, as used for schema-only payloads.
    pub fn ipc_schema_only() -> Bytes {
        let schema = test_schema();
        let mut writer = StreamWriter::try_new(Vec::new(), &schema).unwrap();
        writer.finish().unwrap();
        Bytes::from(writer.into_inner().unwrap())
    }

    /// An LZ4-framed IPC stream.
    pub fn lz4_ipc_chunk(batches: &[&[i64]]) -> Bytes {
        use std::io::Write;

        let plain = ipc_chunk(batches);
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(&plain).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }
}
