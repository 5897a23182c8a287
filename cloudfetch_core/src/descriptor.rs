//! Chunk descriptors as handed out by the server
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// The identity of a chunk within a statement's result set
///
/// Stable for the lifetime of the pipeline. Refreshing a URL never
/// changes the identity, only the [ChunkLink].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Dense, 0-based position assigned by the fetcher
    pub chunk_index: u64,
    /// First row contained in this chunk
    pub start_row_offset: u64,
    /// Number of rows contained in this chunk
    pub row_count: u64,
    /// On-the-wire size of the chunk file in bytes
    pub byte_count: u64,
}

impl ChunkMeta {
    /// Offset of the first row after this chunk
    pub fn end_row_offset(&self) -> u64 {
        self.start_row_offset + self.row_count
    }
}

/// The downloadable part of a descriptor
///
/// Replaced as a whole when a URL is refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLink {
    /// Presigned cloud storage URL
    pub url: String,
    /// Absolute UTC time at which the URL stops working
    pub expiry_time: DateTime<Utc>,
    /// Extra headers some cloud storage providers require
    pub http_headers: Vec<(String, String)>,
}

impl ChunkLink {
    pub fn new<T: Into<String>>(url: T, expiry_time: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            expiry_time,
            http_headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.http_headers = headers;
        self
    }

    /// `true` if the URL expires within `buffer` of `now`.
    ///
    /// Also `true` if it already expired.
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: std::time::Duration) -> bool {
        let buffer = ChronoDuration::from_std(buffer).unwrap_or_else(|_| ChronoDuration::zero());
        self.expiry_time - now <= buffer
    }
}

/// One result file in cloud storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub meta: ChunkMeta,
    pub link: ChunkLink,
}

impl ChunkDescriptor {
    pub fn new(meta: ChunkMeta, link: ChunkLink) -> Self {
        Self { meta, link }
    }

    pub fn chunk_index(&self) -> u64 {
        self.meta.chunk_index
    }

    pub fn start_row_offset(&self) -> u64 {
        self.meta.start_row_offset
    }

    pub fn byte_count(&self) -> u64 {
        self.meta.byte_count
    }
}
