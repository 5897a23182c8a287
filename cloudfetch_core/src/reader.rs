//! Decoding downloaded chunks into record batches
use std::io::Cursor;

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_schema::SchemaRef;
use bytes::Bytes;
use tracing::debug;

use crate::download::ChunkPayload;
use crate::errors::CloudFetchError;
use crate::machinery::DownloadManager;

/// Reads the Arrow schema out of a standalone IPC stream.
///
/// Used for manifest schema payloads that carry no batches.
pub fn schema_from_ipc_bytes(bytes: &[u8]) -> Result<SchemaRef, CloudFetchError> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    Ok(reader.schema())
}

struct ChunkCursor {
    reader: StreamReader<Cursor<Bytes>>,
    /// Keeps the chunk's byte budget and slot reserved while batches
    /// from it may still be handed out
    _payload: ChunkPayload,
}

/// Delivers the record batches of a statement in chunk order
///
/// One Arrow IPC stream per chunk; the chunk's memory is given back to
/// the byte budget as soon as its last batch was read.
pub struct CloudFetchReader {
    manager: DownloadManager,
    current: Option<ChunkCursor>,
    schema: Option<SchemaRef>,
}

impl CloudFetchReader {
    /// Creates a reader on top of a started [DownloadManager].
    ///
    /// `schema_hint` is the schema from the result manifest, used when
    /// the result set contains no chunks at all.
    pub fn new(manager: DownloadManager, schema_hint: Option<SchemaRef>) -> Self {
        Self {
            manager,
            current: None,
            schema: schema_hint,
        }
    }

    /// The schema of the result set.
    ///
    /// Taken from the first chunk's IPC stream; for an empty result
    /// set the manifest schema is used. Fails if neither exists.
    pub async fn schema(&mut self) -> Result<SchemaRef, CloudFetchError> {
        if self.current.is_none() && self.schema.is_none() {
            // peek at the first chunk; its batches stay available
            self.pull_next_chunk().await?;
        }

        if let Some(cursor) = &self.current {
            return Ok(cursor.reader.schema());
        }
        match &self.schema {
            Some(schema) => Ok(schema.clone()),
            None => Err(CloudFetchError::new_invalid_state(
                "the result set is empty and no manifest schema was provided",
            )),
        }
    }

    /// The next record batch, or `None` at the end of the stream.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>, CloudFetchError> {
        loop {
            if let Some(cursor) = &mut self.current {
                match cursor.reader.next() {
                    Some(Ok(batch)) => return Ok(Some(batch)),
                    Some(Err(err)) => {
                        let err = CloudFetchError::from(err);
                        self.manager.control().fail(err.clone());
                        self.current = None;
                        return Err(err);
                    }
                    None => {
                        // chunk drained; dropping the cursor releases
                        // its byte budget and download slot
                        self.current = None;
                        continue;
                    }
                }
            }

            if !self.pull_next_chunk().await? {
                return Ok(None);
            }
        }
    }

    async fn pull_next_chunk(&mut self) -> Result<bool, CloudFetchError> {
        match self.manager.next().await? {
            Some(payload) => {
                debug!(
                    chunk_index = payload.meta().chunk_index,
                    row_count = payload.meta().row_count,
                    "decoding chunk"
                );
                let reader = match StreamReader::try_new(Cursor::new(payload.bytes()), None) {
                    Ok(reader) => reader,
                    Err(err) => {
                        let err = CloudFetchError::from(err);
                        self.manager.control().fail(err.clone());
                        return Err(err);
                    }
                };
                if self.schema.is_none() {
                    self.schema = Some(reader.schema());
                }
                self.current = Some(ChunkCursor {
                    reader,
                    _payload: payload,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops the pipeline and releases all resources.
    ///
    /// Reading after `close` fails with an invalid-state error.
    pub async fn close(&mut self) {
        self.current = None;
        self.manager.stop().await;
    }
}
