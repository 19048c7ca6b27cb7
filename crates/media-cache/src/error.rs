use std::sync::Arc;

/// Errors produced by the cache engine.
///
/// The enum is `Clone` so a single network failure can be fanned out to every
/// sibling request of a download session.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network response carried no data")]
    EmptyNetworkResponse,

    #[error("Resource is not media: {0}")]
    NotMedia(String),

    #[error("Resource is being downloaded: {0}")]
    ResourceBusy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Server returned status code {0}")]
    HttpStatus(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: Arc<serde_json::Error>,
    },
}

impl CacheError {
    /// Returns `true` for failures raised by the network layer.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            CacheError::Network(_)
                | CacheError::HttpStatus(_)
                | CacheError::EmptyNetworkResponse
                | CacheError::NotMedia(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

// Arc wrapping keeps the error cloneable, so the conversions are spelled out.
impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization {
            source: Arc::new(err),
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Network(err.to_string())
    }
}

impl From<url::ParseError> for CacheError {
    fn from(err: url::ParseError) -> Self {
        CacheError::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
