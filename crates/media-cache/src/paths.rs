//! # Cache paths
//!
//! Deterministic mapping from a resource to the files it owns inside the
//! cache directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::resource::MediaResource;

const CONFIG_FILE_EXT: &str = "json";
const EVICTION_INDEX_FILE: &str = "lru.json";

/// Converts a cache key into the file name prefix used on disk.
pub type FileNameConversion = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct CachePaths {
    directory: PathBuf,
    conversion: Option<FileNameConversion>,
}

impl CachePaths {
    pub fn new(directory: impl Into<PathBuf>, conversion: Option<FileNameConversion>) -> Self {
        Self {
            directory: directory.into(),
            conversion,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name_prefix(&self, cache_key: &str) -> String {
        match &self.conversion {
            Some(convert) => convert(cache_key),
            None => cache_key.to_string(),
        }
    }

    /// Name of the data file, `<prefix>.<url extension>`. The separator is
    /// kept for URLs without an extension so no resource can be named like
    /// the eviction index.
    pub fn data_file_name(&self, resource: &MediaResource) -> String {
        let prefix = self.file_name_prefix(resource.cache_key());
        let ext = resource.path_extension().unwrap_or_default();
        format!("{prefix}.{ext}")
    }

    /// Name of the per-resource configuration file, `<data file>.json`.
    pub fn config_file_name(&self, resource: &MediaResource) -> String {
        format!("{}.{CONFIG_FILE_EXT}", self.data_file_name(resource))
    }

    pub fn data_file(&self, resource: &MediaResource) -> PathBuf {
        self.directory.join(self.data_file_name(resource))
    }

    pub fn config_file(&self, resource: &MediaResource) -> PathBuf {
        self.directory.join(self.config_file_name(resource))
    }

    pub fn eviction_index_file(&self) -> PathBuf {
        self.directory.join(EVICTION_INDEX_FILE)
    }

    pub fn eviction_index_file_name(&self) -> &'static str {
        EVICTION_INDEX_FILE
    }

    /// Finds the configuration file of `cache_key` without knowing its URL.
    pub fn find_config_file(&self, cache_key: &str) -> Option<PathBuf> {
        let prefix = self.file_name_prefix(cache_key);
        let suffix = format!(".{CONFIG_FILE_EXT}");
        std::fs::read_dir(&self.directory)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .find(|name| {
                name != EVICTION_INDEX_FILE
                    && name.ends_with(&suffix)
                    && name.starts_with(&format!("{prefix}."))
            })
            .map(|name| self.directory.join(name))
    }
}

impl fmt::Debug for CachePaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePaths")
            .field("directory", &self.directory)
            .field("conversion", &self.conversion.is_some())
            .finish()
    }
}
