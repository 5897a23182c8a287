//! # CloudFetch over the REST statement execution API
//!
//! Fetches chunk descriptors from the manifest a statement execution
//! returns and from `GET /statements/{id}/result/chunks/{index}`.
//!
//! The HTTP client for the statement API stays outside this crate:
//! anything that can answer chunk queries implements
//! [StatementExecutionApi] and plugs into the pipeline.
//!
//! ```rust, ignore
//! use std::sync::Arc;
//!
//! use cloudfetch_rest::*;
//! use cloudfetch_core::config::Config;
//!
//! # async {
//! let api: Arc<dyn StatementExecutionApi> = my_statement_api();
//! let initial: ResultData = execution_response_result_data();
//! let fetcher = Arc::new(RestResultFetcher::new(api, "stmt-42", initial, &Config::default()));
//!
//! let cloudfetch = CloudFetch::new(Config::default()).unwrap();
//! let reader = cloudfetch.open_reader(fetcher, ResultSetInfo::default()).unwrap();
//! # };
//! # ()
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow_schema::SchemaRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cloudfetch_core::config::Config;
use cloudfetch_core::descriptor::{ChunkDescriptor, ChunkLink, ChunkMeta};
use cloudfetch_core::errors::CloudFetchError;
use cloudfetch_core::fetch::{enqueue, FetchItem, FetchState, ResultFetcher};
use cloudfetch_core::reader::schema_from_ipc_bytes;
use cloudfetch_core::PipelineControl;

pub use cloudfetch_core::*;

/// One presigned result file as the statement API describes it
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExternalLink {
    pub external_link: String,
    /// RFC 3339 expiration of the presigned URL
    pub expiration: DateTime<Utc>,
    pub chunk_index: u64,
    pub row_count: u64,
    pub row_offset: u64,
    pub byte_count: u64,
    #[serde(default)]
    pub http_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub next_chunk_index: Option<u64>,
    #[serde(default)]
    pub next_chunk_internal_link: Option<String>,
}

/// One page of external links
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ResultData {
    #[serde(default)]
    pub external_links: Vec<ExternalLink>,
    #[serde(default)]
    pub next_chunk_index: Option<u64>,
    #[serde(default)]
    pub next_chunk_internal_link: Option<String>,
}

enum Cursor {
    Index(u64),
    InternalLink(String),
}

impl ResultData {
    fn next_cursor(&self) -> Option<Cursor> {
        if let Some(link) = &self.next_chunk_internal_link {
            return Some(Cursor::InternalLink(link.clone()));
        }
        if let Some(index) = self.next_chunk_index {
            return Some(Cursor::Index(index));
        }

        let last = self.external_links.last()?;
        if let Some(link) = &last.next_chunk_internal_link {
            return Some(Cursor::InternalLink(link.clone()));
        }
        last.next_chunk_index.map(Cursor::Index)
    }
}

/// The manifest of a statement's result set
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ResultManifest {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub total_chunk_count: u64,
    #[serde(default)]
    pub total_row_count: u64,
    #[serde(default)]
    pub total_byte_count: u64,
    #[serde(default)]
    pub truncated: bool,
    /// Arrow IPC stream carrying the schema only
    #[serde(default)]
    pub schema_bytes: Option<Vec<u8>>,
}

impl ResultManifest {
    /// Decodes the manifest schema, used for empty result sets.
    pub fn arrow_schema(&self) -> Result<Option<SchemaRef>, CloudFetchError> {
        match &self.schema_bytes {
            Some(bytes) => schema_from_ipc_bytes(bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// A failed call against the statement API
#[derive(Error, Debug)]
#[error("statement api call failed: {0}")]
pub struct StatementApiError(pub String);

/// The statement API surface the fetcher needs
#[async_trait]
pub trait StatementExecutionApi: Send + Sync + 'static {
    /// `GET /statements/{statement_id}/result/chunks/{chunk_index}`
    async fn result_chunk(
        &self,
        statement_id: &str,
        chunk_index: u64,
    ) -> Result<ResultData, StatementApiError>;

    /// Follows a `next_chunk_internal_link` cursor.
    async fn result_chunk_by_link(
        &self,
        internal_link: &str,
    ) -> Result<ResultData, StatementApiError>;
}

/// [ResultFetcher] over the REST statement execution API
pub struct RestResultFetcher {
    api: Arc<dyn StatementExecutionApi>,
    statement_id: String,
    state: Arc<FetchState>,
    query_timeout: Duration,
    initial: Mutex<Option<ResultData>>,
}

impl RestResultFetcher {
    /// `initial` is the `ResultData` included with the statement
    /// execution response; its links are emitted without any extra
    /// round trip.
    pub fn new<T: Into<String>>(
        api: Arc<dyn StatementExecutionApi>,
        statement_id: T,
        initial: ResultData,
        config: &Config,
    ) -> Self {
        Self {
            api,
            statement_id: statement_id.into(),
            state: Arc::new(FetchState::new()),
            query_timeout: config.query_timeout.into_duration(),
            initial: Mutex::new(Some(initial)),
        }
    }
}

/// Bounds one API call by the query timeout and the stop signal.
async fn bounded<F, T>(
    query_timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, CloudFetchError>
where
    F: Future<Output = Result<T, StatementApiError>>,
{
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(CloudFetchError::new_cancelled()),
        response = tokio::time::timeout(query_timeout, call) => response,
    };

    match response {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(CloudFetchError::new_server_fetch(err.to_string())),
        Err(_) => Err(CloudFetchError::new_server_fetch(format!(
            "statement API call timed out after {query_timeout:?}"
        ))),
    }
}

/// Converts an external link into a descriptor with a fresh client
/// index.
///
/// Call only while the RPC gate is held: the URL cache is updated as a
/// side effect, keyed by row offset and carrying the server-side chunk
/// index for later refreshes.
fn descriptor_from_link(state: &FetchState, link: ExternalLink) -> ChunkDescriptor {
    let headers: Vec<(String, String)> = link.http_headers.unwrap_or_default().into_iter().collect();
    let chunk_link = ChunkLink::new(link.external_link, link.expiration).with_headers(headers);
    state.remember_link(link.row_offset, chunk_link.clone(), Some(link.chunk_index));

    ChunkDescriptor::new(
        ChunkMeta {
            chunk_index: state.next_index(),
            start_row_offset: link.row_offset,
            row_count: link.row_count,
            byte_count: link.byte_count,
        },
        chunk_link,
    )
}

fn descriptors_from_page(state: &FetchState, page: &mut ResultData) -> Vec<ChunkDescriptor> {
    let mut links = std::mem::take(&mut page.external_links);
    links.sort_by_key(|link| link.row_offset);
    links
        .into_iter()
        .map(|link| descriptor_from_link(state, link))
        .collect()
}

#[async_trait]
impl ResultFetcher for RestResultFetcher {
    fn start(
        &self,
        queue: mpsc::Sender<FetchItem>,
        control: PipelineControl,
    ) -> Result<JoinHandle<()>, CloudFetchError> {
        self.state.try_start()?;

        let state = Arc::clone(&self.state);
        let api = Arc::clone(&self.api);
        let statement_id = self.statement_id.clone();
        let query_timeout = self.query_timeout;
        let initial = self.initial.lock().unwrap().take().unwrap_or_default();

        Ok(tokio::spawn(async move {
            let mut page = initial;
            debug!(
                links = page.external_links.len(),
                "emitting manifest links without a round trip"
            );

            loop {
                // the cursor may live on the last link, so read it
                // before the links are consumed
                let cursor = page.next_cursor();

                let descriptors = {
                    let _gate = state.rpc_gate().lock().await;
                    descriptors_from_page(&state, &mut page)
                };

                for descriptor in descriptors {
                    if enqueue(&queue, FetchItem::Chunk(descriptor), control.token())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }

                let cursor = match cursor {
                    Some(cursor) => cursor,
                    None => break,
                };

                let _gate = state.rpc_gate().lock().await;
                let next = match cursor {
                    Cursor::Index(index) => {
                        debug!(chunk_index = index, "following the chunk index cursor");
                        bounded(
                            query_timeout,
                            control.token(),
                            api.result_chunk(&statement_id, index),
                        )
                        .await
                    }
                    Cursor::InternalLink(link) => {
                        debug!(link = %link, "following the internal link cursor");
                        bounded(
                            query_timeout,
                            control.token(),
                            api.result_chunk_by_link(&link),
                        )
                        .await
                    }
                };

                page = match next {
                    Ok(page) => page,
                    Err(err) if err.is_cancelled() => return,
                    Err(err) => {
                        state.fail(err.clone());
                        control.fail(err);
                        return;
                    }
                };
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

        // the refresh endpoint is addressed by the server's chunk
        // index; the cache translates from the row offset
        let remote_index = self.state.cached_remote_index(start_row_offset).ok_or_else(|| {
            CloudFetchError::new_server_fetch(format!(
                "refresh requested for unknown row offset {start_row_offset}"
            ))
        })?;

        debug!(start_row_offset, remote_index, "refreshing links");
        let mut page = match bounded(
            self.query_timeout,
            cancel,
            self.api.result_chunk(&self.statement_id, remote_index),
        )
        .await
        {
            Ok(page) => page,
            Err(err) => {
                if !err.is_cancelled() {
                    self.state.fail(err.clone());
                }
                return Err(err);
            }
        };

        Ok(descriptors_from_page(&self.state, &mut page))
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

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use cloudfetch_core::errors::CloudFetchErrorKind;

    use super::*;

    fn external_link(chunk_index: u64, row_offset: u64, row_count: u64, url: &str) -> ExternalLink {
        ExternalLink {
            external_link: url.to_string(),
            expiration: Utc::now() + chrono::Duration::hours(1),
            chunk_index,
            row_count,
            row_offset,
            byte_count: 1024,
            http_headers: None,
            next_chunk_index: None,
            next_chunk_internal_link: None,
        }
    }

    struct FakeApi {
        pages: Mutex<HashMap<u64, VecDeque<Result<ResultData, StatementApiError>>>>,
        link_pages: Mutex<HashMap<String, ResultData>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                pages: Mutex::new(HashMap::new()),
                link_pages: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn push_chunk(&self, chunk_index: u64, page: ResultData) {
            self.pages
                .lock()
                .unwrap()
                .entry(chunk_index)
                .or_default()
                .push_back(Ok(page));
        }

        fn push_chunk_error(&self, chunk_index: u64, message: &str) {
            self.pages
                .lock()
                .unwrap()
                .entry(chunk_index)
                .or_default()
                .push_back(Err(StatementApiError(message.to_string())));
        }

        fn put_link(&self, internal_link: &str, page: ResultData) {
            self.link_pages
                .lock()
                .unwrap()
                .insert(internal_link.to_string(), page);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatementExecutionApi for FakeApi {
        async fn result_chunk(
            &self,
            statement_id: &str,
            chunk_index: u64,
        ) -> Result<ResultData, StatementApiError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{statement_id}/chunks/{chunk_index}"));
            self.pages
                .lock()
                .unwrap()
                .get_mut(&chunk_index)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| {
                    Err(StatementApiError(format!(
                        "no scripted page for chunk {chunk_index}"
                    )))
                })
        }

        async fn result_chunk_by_link(
            &self,
            internal_link: &str,
        ) -> Result<ResultData, StatementApiError> {
            self.calls.lock().unwrap().push(internal_link.to_string());
            self.link_pages
                .lock()
                .unwrap()
                .get(internal_link)
                .cloned()
                .ok_or_else(|| StatementApiError(format!("no scripted page for {internal_link}")))
        }
    }

    async fn collect(mut queue: mpsc::Receiver<FetchItem>) -> (Vec<ChunkDescriptor>, bool) {
        let mut descriptors = Vec::new();
        while let Some(item) = queue.recv().await {
            match item {
                FetchItem::Chunk(descriptor) => descriptors.push(descriptor),
                FetchItem::EndOfResults => return (descriptors, true),
            }
        }
        (descriptors, false)
    }

    #[tokio::test]
    async fn manifest_links_are_emitted_before_any_api_call() {
        let api = Arc::new(FakeApi::new());

        let initial = ResultData {
            external_links: vec![
                external_link(0, 0, 10, "u0"),
                external_link(1, 10, 10, "u1"),
            ],
            ..ResultData::default()
        };

        let fetcher = RestResultFetcher::new(
            Arc::clone(&api) as Arc<dyn StatementExecutionApi>,
            "stmt-1",
            initial,
            &Config::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let task = fetcher.start(tx, PipelineControl::new()).unwrap();
        let (descriptors, clean) = collect(rx).await;
        task.await.unwrap();

        assert!(clean);
        assert!(api.calls().is_empty());
        assert_eq!(
            descriptors.iter().map(|d| d.meta.chunk_index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(descriptors[0].link.url, "u0");
        assert!(fetcher.is_completed());
    }

    #[tokio::test]
    async fn the_chunk_index_cursor_is_followed_to_the_end() {
        let api = Arc::new(FakeApi::new());
        api.push_chunk(
            1,
            ResultData {
                external_links: vec![external_link(1, 10, 10, "u1")],
                next_chunk_index: Some(2),
                ..ResultData::default()
            },
        );
        api.push_chunk(
            2,
            ResultData {
                external_links: vec![external_link(2, 20, 4, "u2")],
                ..ResultData::default()
            },
        );

        let initial = ResultData {
            external_links: vec![external_link(0, 0, 10, "u0")],
            next_chunk_index: Some(1),
            ..ResultData::default()
        };

        let fetcher = RestResultFetcher::new(
            Arc::clone(&api) as Arc<dyn StatementExecutionApi>,
            "stmt-1",
            initial,
            &Config::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let task = fetcher.start(tx, PipelineControl::new()).unwrap();
        let (descriptors, clean) = collect(rx).await;
        task.await.unwrap();

        assert!(clean);
        assert_eq!(
            descriptors.iter().map(|d| d.link.url.as_str()).collect::<Vec<_>>(),
            vec!["u0", "u1", "u2"]
        );
        // client indices stay dense no matter what the server calls
        // the chunks
        assert_eq!(
            descriptors.iter().map(|d| d.meta.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            api.calls(),
            vec!["stmt-1/chunks/1".to_string(), "stmt-1/chunks/2".to_string()]
        );
    }

    #[tokio::test]
    async fn the_internal_link_cursor_takes_precedence() {
        let api = Arc::new(FakeApi::new());
        api.put_link(
            "/internal/next-page",
            ResultData {
                external_links: vec![external_link(1, 10, 10, "u1")],
                ..ResultData::default()
            },
        );

        let initial = ResultData {
            external_links: vec![external_link(0, 0, 10, "u0")],
            next_chunk_index: Some(99),
            next_chunk_internal_link: Some("/internal/next-page".to_string()),
        };

        let fetcher = RestResultFetcher::new(
            Arc::clone(&api) as Arc<dyn StatementExecutionApi>,
            "stmt-1",
            initial,
            &Config::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let task = fetcher.start(tx, PipelineControl::new()).unwrap();
        let (descriptors, clean) = collect(rx).await;
        task.await.unwrap();

        assert!(clean);
        assert_eq!(descriptors.len(), 2);
        assert_eq!(api.calls(), vec!["/internal/next-page".to_string()]);
    }

    #[tokio::test]
    async fn refresh_translates_the_offset_to_the_server_chunk_index() {
        let api = Arc::new(FakeApi::new());
        api.push_chunk(
            1,
            ResultData {
                external_links: vec![external_link(1, 10, 10, "u1-fresh")],
                ..ResultData::default()
            },
        );

        let initial = ResultData {
            external_links: vec![
                external_link(0, 0, 10, "u0"),
                external_link(1, 10, 10, "u1"),
            ],
            ..ResultData::default()
        };

        let fetcher = RestResultFetcher::new(
            Arc::clone(&api) as Arc<dyn StatementExecutionApi>,
            "stmt-1",
            initial,
            &Config::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let task = fetcher.start(tx, PipelineControl::new()).unwrap();
        let (_, clean) = collect(rx).await;
        task.await.unwrap();
        assert!(clean);

        let refreshed = fetcher
            .refresh(10, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].meta.start_row_offset, 10);
        assert_eq!(refreshed[0].link.url, "u1-fresh");
        assert_eq!(api.calls(), vec!["stmt-1/chunks/1".to_string()]);
    }

    #[tokio::test]
    async fn refresh_for_an_unknown_offset_fails() {
        let api = Arc::new(FakeApi::new());
        let fetcher = RestResultFetcher::new(
            Arc::clone(&api) as Arc<dyn StatementExecutionApi>,
            "stmt-1",
            ResultData::default(),
            &Config::default(),
        );

        let err = fetcher
            .refresh(1234, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CloudFetchErrorKind::ServerFetch);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn an_api_error_terminates_the_fetcher_and_the_pipeline() {
        let api = Arc::new(FakeApi::new());
        api.push_chunk_error(1, "gateway timeout");

        let initial = ResultData {
            external_links: vec![external_link(0, 0, 10, "u0")],
            next_chunk_index: Some(1),
            ..ResultData::default()
        };

        let fetcher = RestResultFetcher::new(
            Arc::clone(&api) as Arc<dyn StatementExecutionApi>,
            "stmt-1",
            initial,
            &Config::default(),
        );

        let control = PipelineControl::new();
        let (tx, rx) = mpsc::channel(8);
        let task = fetcher.start(tx, control.clone()).unwrap();
        let (descriptors, clean) = collect(rx).await;
        task.await.unwrap();

        assert_eq!(descriptors.len(), 1);
        assert!(!clean, "no sentinel after a failure");
        assert_eq!(
            fetcher.last_error().unwrap().kind(),
            CloudFetchErrorKind::ServerFetch
        );
        assert_eq!(
            control.error().unwrap().kind(),
            CloudFetchErrorKind::ServerFetch
        );
    }

    #[test]
    fn external_links_parse_from_the_wire_shape() {
        let json = r#"{
            "external_links": [{
                "external_link": "https://storage.example.com/chunk0?sig=abc",
                "expiration": "2026-08-01T12:00:00Z",
                "chunk_index": 0,
                "row_count": 100,
                "row_offset": 0,
                "byte_count": 4096,
                "http_headers": {"x-ms-blob-type": "BlockBlob"},
                "next_chunk_index": 1
            }],
            "next_chunk_internal_link": "/api/2.0/statements/abc/result/chunks/1"
        }"#;

        let data: ResultData = serde_json::from_str(json).unwrap();

        assert_eq!(data.external_links.len(), 1);
        let link = &data.external_links[0];
        assert_eq!(link.chunk_index, 0);
        assert_eq!(link.byte_count, 4096);
        assert_eq!(link.next_chunk_index, Some(1));
        assert_eq!(
            link.http_headers.as_ref().unwrap().get("x-ms-blob-type"),
            Some(&"BlockBlob".to_string())
        );
        assert_eq!(
            data.next_chunk_internal_link.as_deref(),
            Some("/api/2.0/statements/abc/result/chunks/1")
        );
    }

    #[test]
    fn the_manifest_schema_decodes_from_ipc_bytes() {
        use arrow_ipc::writer::StreamWriter;
        use arrow_schema::{DataType, Field, Schema};

        let schema = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let mut writer = StreamWriter::try_new(Vec::new(), &schema).unwrap();
        writer.finish().unwrap();
        let bytes = writer.into_inner().unwrap();

        let manifest = ResultManifest {
            schema_bytes: Some(bytes),
            ..ResultManifest::default()
        };

        let decoded = manifest.arrow_schema().unwrap().unwrap();
        assert_eq!(decoded.field(0).name(), "id");

        assert!(ResultManifest::default().arrow_schema().unwrap().is_none());
    }
}
