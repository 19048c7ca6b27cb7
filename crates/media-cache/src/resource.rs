//! # Resources
//!
//! Identity of a cacheable remote media item, the content metadata learned
//! from the network, and the windows of a resource that may be persisted.

use std::collections::HashMap;
use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CacheError, Result};
use crate::range::ByteRange;

/// Stable key identifying a cached resource.
pub type CacheKey = String;

/// One cacheable remote media item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaResource {
    cache_key: CacheKey,
    url: Url,
}

impl MediaResource {
    /// Creates a resource for `url`. Without an explicit key the lowercase hex
    /// MD5 of the URL string is used.
    pub fn new(url: &str, cache_key: Option<CacheKey>) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| CacheError::InvalidUrl(format!("{url}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(CacheError::InvalidUrl(url.to_string()));
        }
        let cache_key = cache_key.unwrap_or_else(|| default_cache_key(url.as_str()));
        Ok(Self { cache_key, url })
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// File extension of the last path segment, if any.
    pub fn path_extension(&self) -> Option<&str> {
        let segment = self.url.path_segments()?.next_back()?;
        let (stem, ext) = segment.rsplit_once('.')?;
        (!stem.is_empty() && !ext.is_empty()).then_some(ext)
    }
}

impl fmt::Display for MediaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.cache_key, self.url)
    }
}

pub fn default_cache_key(url: &str) -> CacheKey {
    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content metadata learned from the first successful network response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    #[serde(rename = "contentType")]
    pub mime_type: Option<String>,
    #[serde(rename = "contentLength")]
    pub total_length: u64,
    #[serde(rename = "isByteRangeAccessSupported")]
    pub supports_byte_range_access: bool,
}

impl ContentInfo {
    pub fn is_missing(&self) -> bool {
        self.total_length == 0
    }

    /// Builds content info from response headers keyed by lowercase name.
    pub fn from_response(status: u16, headers: &HashMap<String, String>) -> Self {
        let mime_type = headers
            .get("content-type")
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());

        let total_length = headers
            .get("content-range")
            .and_then(|value| value.rsplit('/').next())
            .and_then(|total| total.trim().parse::<u64>().ok())
            .or_else(|| {
                // A full 200 response carries the total in Content-Length.
                (status == 200)
                    .then(|| headers.get("content-length"))
                    .flatten()
                    .and_then(|len| len.trim().parse::<u64>().ok())
            })
            .unwrap_or(0);

        let supports_byte_range_access = status == 206
            || headers
                .get("accept-ranges")
                .is_some_and(|value| value.contains("bytes"));

        Self {
            mime_type,
            total_length,
            supports_byte_range_access,
        }
    }

    /// Rejects content types that cannot carry media.
    pub fn ensure_media(&self) -> Result<()> {
        match self.mime_type.as_deref() {
            None => Ok(()),
            Some(mime)
                if mime.starts_with("video/")
                    || mime.starts_with("audio/")
                    || mime.starts_with("application/") =>
            {
                Ok(())
            }
            Some(mime) => Err(CacheError::NotMedia(mime.to_string())),
        }
    }
}

/// A window of a resource eligible for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFragment {
    /// The first `n` bytes.
    Prefix(u64),
    /// The last `n` bytes.
    Suffix(u64),
    /// An explicit range.
    Range(ByteRange),
}

impl CacheFragment {
    /// Resolves the window against the resource's total length.
    pub fn resolve(&self, total_length: u64) -> ByteRange {
        match *self {
            CacheFragment::Prefix(len) => ByteRange::new(0, len),
            CacheFragment::Suffix(len) => {
                ByteRange::new(total_length.saturating_sub(len), total_length)
            }
            CacheFragment::Range(range) => range,
        }
    }
}

impl Default for CacheFragment {
    fn default() -> Self {
        CacheFragment::Prefix(u64::MAX)
    }
}
