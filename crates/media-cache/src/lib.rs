//! # Media Cache
//!
//! A disk-backed, range-addressable cache for progressively downloaded media.
//! A player asks for arbitrary byte ranges of a remote resource; the cache
//! serves what is already on disk, fetches the gaps over HTTP, persists the
//! new bytes and keeps total usage under a configured limit.
//!
//! ## Features
//!
//! - Per-resource fragment tracking persisted next to the data file
//! - Action planning that splits a request into local reads and remote fetches
//! - Concurrent range requests per resource with shared cancellation
//! - Weighted recency/frequency eviction with reserved-prefix truncation
//! - Write admission driven by free space, pinnable by the host application

pub mod builder;
pub mod capacity;
pub mod config;
pub mod download;
pub mod error;
pub mod eviction;
pub mod manager;
pub mod paths;
pub mod range;
pub mod resource;
pub mod session;
pub mod store;

pub use builder::CacheConfigBuilder;
pub use capacity::{FixedFreeSpace, FreeSpaceProbe, SystemFreeSpace};
pub use config::{CacheConfig, HttpConfig, SessionOptions};
pub use error::{CacheError, Result};
pub use eviction::{EvictionEntry, EvictionIndex};
pub use manager::{CacheManager, WriteAdmission};
pub use paths::CachePaths;
pub use range::ByteRange;
pub use resource::{CacheFragment, CacheKey, ContentInfo, MediaResource};
pub use session::CacheSession;
pub use store::{Action, CacheEvent, FileStore, FragmentStore};

// Re-export download types
pub use download::{
    DownloadCoordinator, FetchRequest, FetchResponse, HttpRangeFetcher, RangeEvent, RangeFetcher,
    RangeRequest, WriteGate, create_client,
};
