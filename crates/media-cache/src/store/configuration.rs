//! # Fragment store
//!
//! Per-resource persisted model: which byte ranges are cached, the content
//! metadata, the reserved prefix, and when the resource was last accessed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::range::{self, ByteRange};
use crate::resource::{ContentInfo, MediaResource};

/// On-disk configuration of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub resource: MediaResource,
    pub content_info: ContentInfo,
    pub reserved_length: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub fragments: Vec<ByteRange>,
}

impl Configuration {
    pub fn new(resource: MediaResource) -> Self {
        Self {
            resource,
            content_info: ContentInfo::default(),
            reserved_length: 0,
            last_accessed_at: Utc::now(),
            fragments: Vec::new(),
        }
    }

    /// Reads a configuration file, `None` when it is missing or unreadable.
    pub fn read(path: &Path) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to parse cache configuration");
                None
            }
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

/// Serializes `value` to `path` through a temporary sibling and a rename.
pub(crate) fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, &json)?;
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Thread-safe owner of a resource's [`Configuration`] and its backing file.
#[derive(Debug)]
pub struct FragmentStore {
    path: PathBuf,
    inner: Mutex<Configuration>,
}

impl FragmentStore {
    /// Loads the configuration at `path`, or creates and persists a fresh one.
    pub fn load_or_create(path: impl Into<PathBuf>, resource: &MediaResource) -> Self {
        let path = path.into();
        if let Some(config) = Configuration::read(&path) {
            debug!(key = %resource.cache_key(), fragments = config.fragments.len(), "Loaded cache configuration");
            return Self {
                path,
                inner: Mutex::new(config),
            };
        }

        let store = Self {
            path,
            inner: Mutex::new(Configuration::new(resource.clone())),
        };
        store.synchronize();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored ranges intersecting `range`, clamped to it.
    pub fn overlaps(&self, range: &ByteRange) -> Vec<ByteRange> {
        range::overlapping(&self.inner.lock().fragments, range)
    }

    /// Unions `range` into the fragment set. Invalid ranges are ignored.
    pub fn add(&self, range: ByteRange) {
        if !range.is_valid() {
            return;
        }
        debug!(fragment = %range, "Add fragment");
        range::union_into(&mut self.inner.lock().fragments, range);
    }

    /// Replaces the whole fragment set with `range`.
    pub fn reset(&self, range: ByteRange) {
        debug!(fragment = %range, "Reset fragments");
        let mut config = self.inner.lock();
        config.fragments.clear();
        if range.is_valid() {
            config.fragments.push(range);
        }
    }

    /// Persists the configuration with a fresh access time.
    pub fn synchronize(&self) -> bool {
        let mut config = self.inner.lock();
        config.last_accessed_at = Utc::now();
        match config.write(&self.path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to synchronize cache configuration");
                false
            }
        }
    }

    pub fn resource(&self) -> MediaResource {
        self.inner.lock().resource.clone()
    }

    pub fn fragments(&self) -> Vec<ByteRange> {
        self.inner.lock().fragments.clone()
    }

    /// Upper bound of the highest stored fragment.
    pub fn max_upper(&self) -> Option<u64> {
        self.inner.lock().fragments.iter().map(|r| r.upper).max()
    }

    pub fn content_info(&self) -> ContentInfo {
        self.inner.lock().content_info.clone()
    }

    /// Records `info` unless the content info is already known. Returns
    /// whether it was applied.
    pub fn update_content_info(&self, info: ContentInfo) -> bool {
        let mut config = self.inner.lock();
        if !config.content_info.is_missing() || info.is_missing() {
            return false;
        }
        config.content_info = info;
        true
    }

    pub fn reserved_length(&self) -> u64 {
        self.inner.lock().reserved_length
    }

    pub fn set_reserved_length(&self, length: u64) {
        self.inner.lock().reserved_length = length;
    }

    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.inner.lock().last_accessed_at
    }

    pub fn snapshot(&self) -> Configuration {
        self.inner.lock().clone()
    }
}
