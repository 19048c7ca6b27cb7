use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::download::checksum::DEFAULT_SLICE_SIZE;
use crate::paths::FileNameConversion;
use crate::resource::CacheFragment;
use crate::store::DEFAULT_PACKET_LIMIT;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Name of the cache directory created under the system temp directory.
pub const DEFAULT_DIRECTORY_NAME: &str = "MediaCache";

/// Configuration of a [`CacheManager`](crate::CacheManager).
#[derive(Clone)]
pub struct CacheConfig {
    /// Directory holding every data, configuration and index file
    pub directory: PathBuf,

    /// Disk usage above which the eviction policy starts cleaning
    pub capacity_limit: u64,

    /// Maximum size of a single local read planned by a file store
    pub packet_limit: u64,

    /// Recompute write admission and usage opportunistically
    pub auto_check_usage: bool,

    /// Minimum delay between two usage checks triggered by synchronization
    pub usage_check_interval: Duration,

    /// Initial recency weight of the eviction index
    pub time_weight: u64,

    /// Initial frequency weight of the eviction index
    pub use_weight: u64,

    /// Maximum number of resources evicted by one usage check
    pub max_eviction_batch: usize,

    /// Maps cache keys to file name prefixes
    pub file_name_conversion: Option<FileNameConversion>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join(DEFAULT_DIRECTORY_NAME),
            capacity_limit: 1024 * 1024 * 1024, // 1 GiB
            packet_limit: DEFAULT_PACKET_LIMIT,
            auto_check_usage: true,
            usage_check_interval: Duration::from_secs(10),
            time_weight: 2,
            use_weight: 1,
            max_eviction_batch: 4,
            file_name_conversion: None,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> crate::builder::CacheConfigBuilder {
        crate::builder::CacheConfigBuilder::new()
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("directory", &self.directory)
            .field("capacity_limit", &self.capacity_limit)
            .field("packet_limit", &self.packet_limit)
            .field("auto_check_usage", &self.auto_check_usage)
            .field("usage_check_interval", &self.usage_check_interval)
            .field("time_weight", &self.time_weight)
            .field("use_weight", &self.use_weight)
            .field("max_eviction_batch", &self.max_eviction_batch)
            .field("file_name_conversion", &self.file_name_conversion.is_some())
            .finish()
    }
}

/// Per-resource options of a caching session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Windows of the resource that may be persisted
    pub cacheable_fragments: Vec<CacheFragment>,

    /// Passed through to the network layer with every fetch
    pub allows_cellular_access: bool,

    /// Run the sampling checksum before persisting a remote payload
    pub use_checksum: bool,

    /// Slice size used by the sampling checksum
    pub checksum_slice: usize,

    /// Capacity of the per-request event channel
    pub event_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cacheable_fragments: vec![CacheFragment::default()],
            allows_cellular_access: true,
            use_checksum: false,
            checksum_slice: DEFAULT_SLICE_SIZE,
            event_buffer: 32,
        }
    }
}

/// Options for the reqwest-backed range fetcher.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for the entire HTTP request, zero disables it
    pub timeout: Duration,

    /// Connection timeout, zero disables it
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            // Media bodies stream for a long time; only bound the connect phase.
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert!(config.directory.ends_with(DEFAULT_DIRECTORY_NAME));
        assert_eq!(config.capacity_limit, 1 << 30);
        assert_eq!(config.packet_limit, 1 << 20);
        assert_eq!((config.time_weight, config.use_weight), (2, 1));
        assert_eq!(config.max_eviction_batch, 4);
        assert!(config.auto_check_usage);
    }

    #[test]
    fn test_session_options_cache_everything() {
        let options = SessionOptions::default();
        assert_eq!(options.cacheable_fragments, vec![CacheFragment::Prefix(u64::MAX)]);
        assert!(!options.use_checksum);
        assert_eq!(options.checksum_slice, 1024);
    }

    #[test]
    fn test_http_defaults_disable_compression() {
        let config = HttpConfig::default();
        assert_eq!(
            config.headers.get(reqwest::header::ACCEPT_ENCODING).unwrap(),
            "identity"
        );
        assert!(config.timeout.is_zero());
    }
}
