//! # Builder for CacheConfig
//!
//! Fluent construction of [`CacheConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use media_cache::CacheConfig;
//!
//! let config = CacheConfig::builder()
//!     .with_directory(std::env::temp_dir().join("player-cache"))
//!     .with_capacity_limit(512 * 1024 * 1024)
//!     .with_eviction_weights(3, 1)
//!     .with_usage_check_interval(Duration::from_secs(30))
//!     .with_file_name_conversion(|key| format!("media-{key}"))
//!     .build();
//!
//! assert_eq!(config.capacity_limit, 512 * 1024 * 1024);
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::CacheConfig;

/// Builder for creating CacheConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    /// Set the cache directory
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.directory = directory.into();
        self
    }

    /// Set the disk usage limit in bytes
    pub fn with_capacity_limit(mut self, limit: u64) -> Self {
        self.config.capacity_limit = limit;
        self
    }

    /// Set the maximum size of a single local read
    pub fn with_packet_limit(mut self, limit: u64) -> Self {
        self.config.packet_limit = limit;
        self
    }

    /// Enable or disable opportunistic admission and usage checks
    pub fn with_auto_check_usage(mut self, enabled: bool) -> Self {
        self.config.auto_check_usage = enabled;
        self
    }

    /// Set the minimum delay between synchronization-driven usage checks
    pub fn with_usage_check_interval(mut self, interval: Duration) -> Self {
        self.config.usage_check_interval = interval;
        self
    }

    /// Set the recency and frequency weights of the eviction ranking
    pub fn with_eviction_weights(mut self, time_weight: u64, use_weight: u64) -> Self {
        self.config.time_weight = time_weight;
        self.config.use_weight = use_weight;
        self
    }

    /// Set how many resources one usage check may evict
    pub fn with_max_eviction_batch(mut self, max: usize) -> Self {
        self.config.max_eviction_batch = max;
        self
    }

    /// Set the cache key to file name conversion
    pub fn with_file_name_conversion<F>(mut self, conversion: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.config.file_name_conversion = Some(Arc::new(conversion));
        self
    }

    /// Build the CacheConfig instance
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = CacheConfigBuilder::new().build();
        assert_eq!(config.capacity_limit, 1024 * 1024 * 1024);
        assert_eq!(config.usage_check_interval, Duration::from_secs(10));
        assert!(config.file_name_conversion.is_none());
    }

    #[test]
    fn test_builder_customization() {
        let config = CacheConfigBuilder::new()
            .with_directory("/var/cache/player")
            .with_capacity_limit(1000)
            .with_packet_limit(4096)
            .with_auto_check_usage(false)
            .with_eviction_weights(5, 3)
            .with_max_eviction_batch(2)
            .with_file_name_conversion(|key| key.replace('/', "_"))
            .build();

        assert_eq!(config.directory, PathBuf::from("/var/cache/player"));
        assert_eq!(config.capacity_limit, 1000);
        assert_eq!(config.packet_limit, 4096);
        assert!(!config.auto_check_usage);
        assert_eq!((config.time_weight, config.use_weight), (5, 3));
        assert_eq!(config.max_eviction_batch, 2);

        let convert = config.file_name_conversion.unwrap();
        assert_eq!(convert("a/b"), "a_b");
    }
}
