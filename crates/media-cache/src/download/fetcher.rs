//! Network collaborator issuing byte-ranged GET requests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::debug;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{CacheError, Result};
use crate::range::ByteRange;

/// A ranged GET for one remote action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub range: ByteRange,
    pub allows_cellular_access: bool,
}

/// Body chunks of a response.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Response of a ranged GET: status and headers first, then the body chunks.
pub struct FetchResponse {
    pub status: u16,
    /// Header values keyed by lowercase name.
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &HttpConfig) -> Result<Client> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CacheError::Network(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| CacheError::Network(format!("TLS platform verifier: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(CacheError::from)
}

/// [`RangeFetcher`] backed by a shared reqwest client.
///
/// Cellular restrictions have no meaning for this transport and are ignored.
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: Client,
}

impl HttpRangeFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn with_config(config: &HttpConfig) -> Result<Self> {
        Ok(Self::new(create_client(config)?))
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        debug!(url = %request.url, range = %request.range, "Fetching remote range");

        let response = self
            .client
            .get(request.url.clone())
            .header(reqwest::header::RANGE, request.range.to_header_value())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CacheError::from))
            .boxed();

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

