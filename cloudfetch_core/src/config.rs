//! Configuration of the pipeline
//!
//! All values can also be set via environment variables
//! prefixed with "CLOUDFETCH_".
use std::time::Duration;

use anyhow::{bail, Error as AnyError};

config_value! {
    #[doc="Whether results should be fetched from cloud storage at all.\n\nDefault is `true`."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct UseCloudFetch(bool, env="USE_CLOUD_FETCH");
}

impl Default for UseCloudFetch {
    fn default() -> Self {
        Self(true)
    }
}

config_value! {
    #[doc="Whether the client may advertise LZ4 support and decompress chunk files.\n\nDefault is `true`."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct CanDecompressLz4(bool, env="CAN_DECOMPRESS_LZ4");
}

impl Default for CanDecompressLz4 {
    fn default() -> Self {
        Self(true)
    }
}

config_value! {
    #[doc="Hint to the server for the maximum size of a single chunk file in bytes.\n\nDefault is 10 MiB."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct MaxBytesPerFile(u64, env="MAX_BYTES_PER_FILE");
}

impl Default for MaxBytesPerFile {
    fn default() -> Self {
        Self(10 * 1024 * 1024)
    }
}

config_value! {
    #[doc="Maximum number of chunk downloads running at the same time.\n\nDefault is 3."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct ParallelDownloads(usize, env="PARALLEL_DOWNLOADS");
}

impl Default for ParallelDownloads {
    fn default() -> Self {
        Self(3)
    }
}

config_value! {
    #[doc="Number of chunks to fetch ahead of the consumer.\n\nAlso determines the capacity of the internal queues (twice this value).\n\nDefault is 3."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct PrefetchCount(usize, env="PREFETCH_COUNT");
}

impl Default for PrefetchCount {
    fn default() -> Self {
        Self(3)
    }
}

config_value! {
    #[doc="Memory budget for in-flight chunk buffers in MiB.\n\nDefault is 200 MiB."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct MemoryBufferMib(usize, env="MEMORY_BUFFER_MIB");
}

impl Default for MemoryBufferMib {
    fn default() -> Self {
        Self(200)
    }
}

impl MemoryBufferMib {
    pub fn into_bytes(self) -> u64 {
        self.0 as u64 * 1024 * 1024
    }
}

config_value! {
    #[doc="Slack before a URL's stated expiry during which it is proactively refreshed.\n\nDefault is 60 seconds."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub secs struct UrlExpirationBuffer(u64, env="URL_EXPIRATION_BUFFER_SECONDS");
}

impl Default for UrlExpirationBuffer {
    fn default() -> Self {
        Self(60)
    }
}

config_value! {
    #[doc="Maximum number of generic attempts per chunk download.\n\nDefault is 3."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct MaxRetries(usize, env="MAX_RETRIES");
}

impl Default for MaxRetries {
    fn default() -> Self {
        Self(3)
    }
}

config_value! {
    #[doc="Maximum number of URL refreshes per chunk before the download fails.\n\nDefault is 3."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub copy struct MaxUrlRefreshAttempts(usize, env="MAX_URL_REFRESH_ATTEMPTS");
}

impl Default for MaxUrlRefreshAttempts {
    fn default() -> Self {
        Self(3)
    }
}

config_value! {
    #[doc="Base delay between generic retries. The n-th retry waits n times this value.\n\nDefault is 1000 ms."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub millis struct RetryDelayMillis(u64, env="RETRY_DELAY_MS");
}

impl Default for RetryDelayMillis {
    fn default() -> Self {
        Self(1000)
    }
}

config_value! {
    #[doc="Total timeout for a single chunk file download.\n\nDefault is 5 minutes."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub mins struct HttpTimeoutMinutes(u64, env="HTTP_TIMEOUT_MINUTES");
}

impl Default for HttpTimeoutMinutes {
    fn default() -> Self {
        Self(5)
    }
}

config_value! {
    #[doc="Timeout for a single server RPC issued by a fetcher.\n\nDefault is 60 seconds."]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub secs struct QueryTimeoutSecs(u64, env="QUERY_TIMEOUT_SECONDS");
}

impl Default for QueryTimeoutSecs {
    fn default() -> Self {
        Self(60)
    }
}

/// The configuration of the pipeline
///
/// Contains all recognized options with their defaults.
/// Validation happens when the pipeline is created via [Config::validated].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    pub use_cloud_fetch: UseCloudFetch,
    pub can_decompress_lz4: CanDecompressLz4,
    pub max_bytes_per_file: MaxBytesPerFile,
    pub parallel_downloads: ParallelDownloads,
    pub prefetch_count: PrefetchCount,
    pub memory_buffer_mib: MemoryBufferMib,
    pub url_expiration_buffer: UrlExpirationBuffer,
    pub max_retries: MaxRetries,
    pub max_url_refresh_attempts: MaxUrlRefreshAttempts,
    pub retry_delay: RetryDelayMillis,
    pub http_timeout: HttpTimeoutMinutes,
    pub query_timeout: QueryTimeoutSecs,
}

impl Config {
    pub fn use_cloud_fetch<T: Into<UseCloudFetch>>(mut self, v: T) -> Self {
        self.use_cloud_fetch = v.into();
        self
    }

    pub fn can_decompress_lz4<T: Into<CanDecompressLz4>>(mut self, v: T) -> Self {
        self.can_decompress_lz4 = v.into();
        self
    }

    pub fn max_bytes_per_file<T: Into<MaxBytesPerFile>>(mut self, v: T) -> Self {
        self.max_bytes_per_file = v.into();
        self
    }

    pub fn parallel_downloads<T: Into<ParallelDownloads>>(mut self, v: T) -> Self {
        self.parallel_downloads = v.into();
        self
    }

    pub fn prefetch_count<T: Into<PrefetchCount>>(mut self, v: T) -> Self {
        self.prefetch_count = v.into();
        self
    }

    pub fn memory_buffer_mib<T: Into<MemoryBufferMib>>(mut self, v: T) -> Self {
        self.memory_buffer_mib = v.into();
        self
    }

    pub fn url_expiration_buffer<T: Into<UrlExpirationBuffer>>(mut self, v: T) -> Self {
        self.url_expiration_buffer = v.into();
        self
    }

    pub fn max_retries<T: Into<MaxRetries>>(mut self, v: T) -> Self {
        self.max_retries = v.into();
        self
    }

    pub fn max_url_refresh_attempts<T: Into<MaxUrlRefreshAttempts>>(mut self, v: T) -> Self {
        self.max_url_refresh_attempts = v.into();
        self
    }

    pub fn retry_delay<T: Into<RetryDelayMillis>>(mut self, v: T) -> Self {
        self.retry_delay = v.into();
        self
    }

    pub fn http_timeout<T: Into<HttpTimeoutMinutes>>(mut self, v: T) -> Self {
        self.http_timeout = v.into();
        self
    }

    pub fn query_timeout<T: Into<QueryTimeoutSecs>>(mut self, v: T) -> Self {
        self.query_timeout = v.into();
        self
    }

    /// Capacity of the descriptor and result queues.
    pub fn queue_capacity(&self) -> usize {
        self.prefetch_count.into_inner() * 2
    }

    /// Validates this [Config]
    pub fn validated(self) -> Result<Self, AnyError> {
        if self.parallel_downloads.into_inner() == 0 {
            bail!("'parallel_downloads' must not be 0");
        }

        if self.prefetch_count.into_inner() == 0 {
            bail!("'prefetch_count' must not be 0");
        }

        if self.memory_buffer_mib.into_inner() == 0 {
            bail!("'memory_buffer_mib' must not be 0");
        }

        if self.max_retries.into_inner() == 0 {
            bail!("'max_retries' must not be 0");
        }

        if self.memory_buffer_mib.into_bytes() < self.max_bytes_per_file.into_inner() {
            bail!(
                "'memory_buffer_mib' ({} MiB) must hold at least one file of \
                 'max_bytes_per_file' ({} bytes)",
                self.memory_buffer_mib,
                self.max_bytes_per_file
            );
        }

        Ok(self)
    }

    config_env_ctors!();

    fn fill_from_env_prefixed_internal<T: AsRef<str>>(
        &mut self,
        prefix: T,
    ) -> Result<bool, AnyError> {
        let mut found_any = false;

        if let Some(v) = UseCloudFetch::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.use_cloud_fetch = v;
        }
        if let Some(v) = CanDecompressLz4::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.can_decompress_lz4 = v;
        }
        if let Some(v) = MaxBytesPerFile::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.max_bytes_per_file = v;
        }
        if let Some(v) = ParallelDownloads::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.parallel_downloads = v;
        }
        if let Some(v) = PrefetchCount::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.prefetch_count = v;
        }
        if let Some(v) = MemoryBufferMib::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.memory_buffer_mib = v;
        }
        if let Some(v) = UrlExpirationBuffer::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.url_expiration_buffer = v;
        }
        if let Some(v) = MaxRetries::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.max_retries = v;
        }
        if let Some(v) = MaxUrlRefreshAttempts::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.max_url_refresh_attempts = v;
        }
        if let Some(v) = RetryDelayMillis::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.retry_delay = v;
        }
        if let Some(v) = HttpTimeoutMinutes::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.http_timeout = v;
        }
        if let Some(v) = QueryTimeoutSecs::try_from_env_prefixed(prefix.as_ref())? {
            found_any = true;
            self.query_timeout = v;
        }

        Ok(found_any)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn default_values_match_the_documented_defaults() {
        let config = Config::default();

        assert!(config.use_cloud_fetch.into_inner());
        assert!(config.can_decompress_lz4.into_inner());
        assert_eq!(config.max_bytes_per_file.into_inner(), 10 * 1024 * 1024);
        assert_eq!(config.parallel_downloads.into_inner(), 3);
        assert_eq!(config.prefetch_count.into_inner(), 3);
        assert_eq!(config.memory_buffer_mib.into_bytes(), 200 * 1024 * 1024);
        assert_eq!(config.url_expiration_buffer.into_duration(), Duration::from_secs(60));
        assert_eq!(config.max_retries.into_inner(), 3);
        assert_eq!(config.max_url_refresh_attempts.into_inner(), 3);
        assert_eq!(config.retry_delay.into_duration(), Duration::from_millis(1000));
        assert_eq!(config.http_timeout.into_duration(), Duration::from_secs(300));
        assert_eq!(config.query_timeout.into_duration(), Duration::from_secs(60));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validated().is_ok());
    }

    #[test]
    fn queue_capacity_is_twice_the_prefetch_count() {
        let config = Config::default().prefetch_count(5usize);
        assert_eq!(config.queue_capacity(), 10);
    }

    #[test]
    fn zero_parallel_downloads_is_rejected() {
        assert!(Config::default().parallel_downloads(0usize).validated().is_err());
    }

    #[test]
    fn zero_prefetch_count_is_rejected() {
        assert!(Config::default().prefetch_count(0usize).validated().is_err());
    }

    #[test]
    fn buffer_smaller_than_one_file_is_rejected() {
        let config = Config::default()
            .memory_buffer_mib(1usize)
            .max_bytes_per_file(2u64 * 1024 * 1024);
        assert!(config.validated().is_err());
    }

    #[test]
    fn values_parse_from_the_environment() {
        std::env::set_var("TEST_CFG_A_PARALLEL_DOWNLOADS", "7");
        let parsed = ParallelDownloads::try_from_env_prefixed("TEST_CFG_A").unwrap();
        assert_eq!(parsed, Some(ParallelDownloads::new(7usize)));
        std::env::remove_var("TEST_CFG_A_PARALLEL_DOWNLOADS");
    }

    #[test]
    fn fill_from_env_overrides_only_present_values() {
        std::env::set_var("TEST_CFG_B_PREFETCH_COUNT", "9");
        let config = Config::from_env_prefixed("TEST_CFG_B").unwrap().unwrap();
        assert_eq!(config.prefetch_count.into_inner(), 9);
        assert_eq!(config.parallel_downloads.into_inner(), 3);
        std::env::remove_var("TEST_CFG_B_PREFETCH_COUNT");
    }

    #[test]
    fn from_env_without_any_vars_returns_none() {
        assert!(Config::from_env_prefixed("TEST_CFG_NOTHING_SET").unwrap().is_none());
    }
}
