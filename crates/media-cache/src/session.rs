//! # Caching session
//!
//! Ownership adapter for a playback integration. A session registers its
//! resource with the [`CacheManager`] for as long as it lives and owns the
//! [`DownloadCoordinator`] serving the player's range requests.
//!
//! Teardown happens on [`CacheSession::cache_cancel`] or on drop, whichever
//! comes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::config::SessionOptions;
use crate::download::{DownloadCoordinator, RangeFetcher, RangeRequest, WriteGate};
use crate::error::Result;
use crate::manager::CacheManager;
use crate::range::ByteRange;
use crate::resource::{CacheKey, MediaResource};

pub struct CacheSession {
    manager: Arc<CacheManager>,
    resource: MediaResource,
    coordinator: DownloadCoordinator,
    active: AtomicBool,
}

impl CacheSession {
    /// Starts caching `url`. Without a `cache_key` the MD5 of the URL is used.
    pub fn open(
        manager: &Arc<CacheManager>,
        fetcher: Arc<dyn RangeFetcher>,
        url: &str,
        cache_key: Option<CacheKey>,
        options: SessionOptions,
    ) -> Result<Self> {
        let resource = MediaResource::new(url, cache_key)?;
        manager.visit(&resource);
        manager.add_downloading(&resource);

        let store = match manager.open_store(&resource, options.cacheable_fragments.clone()) {
            Ok(store) => store,
            Err(e) => {
                manager.remove_downloading(&resource);
                return Err(e);
            }
        };

        let gate: Arc<dyn WriteGate> = Arc::clone(manager) as Arc<dyn WriteGate>;
        let coordinator = DownloadCoordinator::new(store, fetcher, gate, options);
        debug!(key = %resource.cache_key(), "Caching session opened");

        Ok(Self {
            manager: Arc::clone(manager),
            resource,
            coordinator,
            active: AtomicBool::new(true),
        })
    }

    pub fn resource(&self) -> &MediaResource {
        &self.resource
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn request(&self, range: ByteRange) -> RangeRequest {
        self.coordinator.request(range)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cancels all in-flight requests and releases the downloading
    /// registration. Later calls do nothing.
    pub fn cache_cancel(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.coordinator.cancel();
            self.manager.remove_downloading(&self.resource);
            debug!(key = %self.resource.cache_key(), "Caching session cancelled");
        }
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        self.cache_cancel();
    }
}

impl std::fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession")
            .field("resource", &self.resource)
            .field("active", &self.is_active())
            .field("in_flight", &self.coordinator.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::FixedFreeSpace;
    use crate::config::CacheConfig;
    use crate::download::{FetchRequest, FetchResponse};
    use crate::error::CacheError;
    use crate::resource::default_cache_key;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::collections::HashMap;

    /// Serves a constant byte for every requested offset.
    struct ConstantFetcher {
        total: u64,
    }

    #[async_trait]
    impl RangeFetcher for ConstantFetcher {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
            let range = request.range;
            let upper = range.upper.min(self.total);
            let headers = HashMap::from([
                ("content-type".to_string(), "audio/mpeg".to_string()),
                (
                    "content-range".to_string(),
                    format!("bytes {}-{}/{}", range.lower, upper - 1, self.total),
                ),
            ]);
            let body = vec![Ok::<_, CacheError>(Bytes::from(vec![
                0xAAu8;
                (upper - range.lower) as usize
            ]))];
            Ok(FetchResponse {
                status: 206,
                headers,
                body: futures::stream::iter(body).boxed(),
            })
        }
    }

    fn manager(dir: &std::path::Path) -> Arc<CacheManager> {
        let config = CacheConfig::builder().with_directory(dir).build();
        CacheManager::new(config, Arc::new(FixedFreeSpace(Some(u64::MAX)))).unwrap()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let url = "https://example.com/song.mp3";

        let session = CacheSession::open(
            &manager,
            Arc::new(ConstantFetcher { total: 4096 }),
            url,
            None,
            SessionOptions::default(),
        )
        .unwrap();

        let key = default_cache_key(url);
        assert_eq!(session.resource().cache_key(), key);
        assert!(manager.is_downloading(&key));
        assert_eq!(manager.index().entry(&key).unwrap().visit_count, 1);
        assert!(matches!(
            manager.clean(session.resource(), false),
            Err(CacheError::ResourceBusy(_))
        ));

        let bytes = session.request(ByteRange::new(0, 1024)).collect().await.unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(
            session.coordinator().store().fragments().fragments(),
            vec![ByteRange::new(0, 1024)]
        );

        session.cache_cancel();
        session.cache_cancel();
        assert!(!session.is_active());
        assert!(!manager.is_downloading(&key));
    }

    #[tokio::test]
    async fn test_drop_releases_registration() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let fetcher: Arc<dyn RangeFetcher> = Arc::new(ConstantFetcher { total: 100 });

        let first = CacheSession::open(
            &manager,
            Arc::clone(&fetcher),
            "https://example.com/a.mp3",
            Some("shared".into()),
            SessionOptions::default(),
        )
        .unwrap();
        let second = CacheSession::open(
            &manager,
            fetcher,
            "https://example.com/a.mp3",
            Some("shared".into()),
            SessionOptions::default(),
        )
        .unwrap();

        drop(first);
        assert!(manager.is_downloading("shared"));
        drop(second);
        assert!(!manager.is_downloading("shared"));
        assert_eq!(manager.index().entry("shared").unwrap().visit_count, 2);
    }

    fn open_shared(manager: &Arc<CacheManager>, fetcher: &Arc<dyn RangeFetcher>) -> CacheSession {
        CacheSession::open(
            manager,
            Arc::clone(fetcher),
            "https://example.com/track.mp3",
            Some("k".into()),
            SessionOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_sessions_share_one_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let fetcher: Arc<dyn RangeFetcher> = Arc::new(ConstantFetcher { total: 10_000 });

        let a = open_shared(&manager, &fetcher);
        let b = open_shared(&manager, &fetcher);
        assert!(Arc::ptr_eq(a.coordinator().store(), b.coordinator().store()));

        a.request(ByteRange::new(0, 1000)).collect().await.unwrap();
        b.request(ByteRange::new(1000, 2000)).collect().await.unwrap();
        drop(a);
        drop(b);

        let config = manager.cached_resource("k").unwrap();
        assert_eq!(config.fragments, vec![ByteRange::new(0, 2000)]);
    }

    #[tokio::test]
    async fn test_gap_between_sessions_is_not_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let fetcher: Arc<dyn RangeFetcher> = Arc::new(ConstantFetcher { total: 10_000 });

        let a = open_shared(&manager, &fetcher);
        let b = open_shared(&manager, &fetcher);
        a.request(ByteRange::new(0, 1000)).collect().await.unwrap();
        b.request(ByteRange::new(5000, 6000)).collect().await.unwrap();
        drop(b);
        drop(a);

        let session = open_shared(&manager, &fetcher);
        assert_eq!(
            session.coordinator().store().fragments().fragments(),
            vec![ByteRange::new(0, 1000), ByteRange::new(5000, 6000)]
        );
        let bytes = session.request(ByteRange::new(2000, 2010)).collect().await.unwrap();
        assert_eq!(&bytes[..], &[0xAAu8; 10]);
    }

    #[tokio::test]
    async fn test_open_ended_request_stops_at_content_end() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let session = CacheSession::open(
            &manager,
            Arc::new(ConstantFetcher { total: 1000 }),
            "https://example.com/short.mp3",
            None,
            SessionOptions::default(),
        )
        .unwrap();

        let bytes = session.request(ByteRange::new(0, u64::MAX)).collect().await.unwrap();
        assert_eq!(bytes.len(), 1000);
    }

    #[test]
    fn test_invalid_url_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let err = CacheSession::open(
            &manager,
            Arc::new(ConstantFetcher { total: 1 }),
            "::nope::",
            None,
            SessionOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::InvalidUrl(_)));
        assert!(manager.downloading_resources().is_empty());
        assert!(manager.index().is_empty());
    }
}
