// Download Coordinator: serves concurrent range requests for one resource from
// the file store and the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::SessionOptions;
use crate::download::checksum;
use crate::download::fetcher::{ByteStream, FetchRequest, RangeFetcher};
use crate::error::{CacheError, Result};
use crate::range::ByteRange;
use crate::resource::ContentInfo;
use crate::store::{Action, FileStore};

/// Decides whether downloaded bytes may be persisted.
pub trait WriteGate: Send + Sync {
    fn allow_write(&self) -> bool;
}

/// Events delivered to the caller of one range request, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeEvent {
    /// Content metadata of the resource.
    ContentInfo(ContentInfo),
    /// Bytes starting at `offset` within the resource.
    Data { offset: u64, bytes: Bytes },
    /// Every action of the request completed.
    Finished,
}

/// Handle to one logical range request.
#[derive(Debug)]
pub struct RangeRequest {
    id: u64,
    range: ByteRange,
    events: mpsc::Receiver<Result<RangeEvent>>,
}

impl RangeRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// Next event, `None` once the request has terminated.
    pub async fn next(&mut self) -> Option<Result<RangeEvent>> {
        self.events.recv().await
    }

    /// Drains the request and concatenates its data.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut data = BytesMut::new();
        while let Some(event) = self.next().await {
            match event? {
                RangeEvent::Data { bytes, .. } => data.extend_from_slice(&bytes),
                RangeEvent::ContentInfo(_) => {}
                RangeEvent::Finished => return Ok(data.freeze()),
            }
        }
        Err(CacheError::Cancelled)
    }
}

struct Shared {
    store: Arc<FileStore>,
    fetcher: Arc<dyn RangeFetcher>,
    gate: Arc<dyn WriteGate>,
    options: SessionOptions,
    in_flight: Mutex<HashMap<u64, CancellationToken>>,
}

/// Multiplexes concurrent range requests against one [`FileStore`].
///
/// A failure of any request other than a cancellation cancels all of its
/// siblings. Dropping the coordinator cancels everything still in flight.
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl DownloadCoordinator {
    pub fn new(
        store: Arc<FileStore>,
        fetcher: Arc<dyn RangeFetcher>,
        gate: Arc<dyn WriteGate>,
        options: SessionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                fetcher,
                gate,
                options,
                in_flight: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.shared.store
    }

    /// Starts serving `range` on the current tokio runtime.
    pub fn request(&self, range: ByteRange) -> RangeRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.shared.in_flight.lock().insert(id, token.clone());

        let (tx, rx) = mpsc::channel(self.shared.options.event_buffer.max(1));
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(CacheError::Cancelled),
                result = shared.serve(id, range, &tx) => result,
            };
            shared.in_flight.lock().remove(&id);

            match result {
                Ok(()) => {
                    debug!(id, %range, "Range request finished");
                    let _ = tx.send(Ok(RangeEvent::Finished)).await;
                }
                Err(e) => {
                    if e.is_cancelled() {
                        debug!(id, %range, "Range request cancelled");
                    } else {
                        warn!(id, %range, error = %e, "Range request failed, cancelling siblings");
                        shared.cancel_all();
                    }
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        RangeRequest {
            id,
            range,
            events: rx,
        }
    }

    /// Cancels one request. Returns whether it was still in flight.
    pub fn cancel_request(&self, id: u64) -> bool {
        match self.shared.in_flight.lock().remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight request.
    pub fn cancel(&self) {
        self.shared.cancel_all();
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        self.shared.cancel_all();
    }
}

impl Shared {
    fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = self
            .in_flight
            .lock()
            .drain()
            .map(|(_, token)| token)
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    #[instrument(skip(self, tx), fields(key = %self.store.resource().cache_key()))]
    async fn serve(
        &self,
        id: u64,
        range: ByteRange,
        tx: &mpsc::Sender<Result<RangeEvent>>,
    ) -> Result<()> {
        let mut info_sent = false;
        if !self.store.is_content_info_missing() {
            deliver(tx, RangeEvent::ContentInfo(self.store.content_info())).await?;
            info_sent = true;
        }

        // Once the length is known an open-ended request ends at the last byte.
        let total_length = self.store.content_info().total_length;
        let range = if total_length > 0 && range.upper > total_length {
            ByteRange::new(range.lower, total_length)
        } else {
            range
        };

        let actions = self.store.actions(range);
        debug!(actions = actions.len(), "Planned range request");

        for action in actions {
            match action {
                Action::Local(local) => {
                    let store = Arc::clone(&self.store);
                    let bytes = blocking(move || store.read(local)).await?;
                    if bytes.is_empty() {
                        continue;
                    }
                    deliver(
                        tx,
                        RangeEvent::Data {
                            offset: local.lower,
                            bytes,
                        },
                    )
                    .await?;
                }
                Action::Remote(remote) => {
                    self.fetch_remote(remote, tx, &mut info_sent).await?;
                }
            }
        }
        Ok(())
    }

    async fn fetch_remote(
        &self,
        range: ByteRange,
        tx: &mpsc::Sender<Result<RangeEvent>>,
        info_sent: &mut bool,
    ) -> Result<()> {
        let request = FetchRequest {
            url: self.store.resource().url().clone(),
            range,
            allows_cellular_access: self.options.allows_cellular_access,
        };
        let response = self.fetcher.fetch(request).await?;

        if !(200..300).contains(&response.status) {
            return Err(CacheError::HttpStatus(response.status));
        }

        if self.store.is_content_info_missing() {
            let info = ContentInfo::from_response(response.status, &response.headers);
            info.ensure_media()?;
            let store = Arc::clone(&self.store);
            blocking(move || Ok(store.update_content_info(info))).await?;
        }
        if !*info_sent && !self.store.is_content_info_missing() {
            deliver(tx, RangeEvent::ContentInfo(self.store.content_info())).await?;
            *info_sent = true;
        }

        // A plain 200 carries the whole resource from offset 0.
        let skip = if response.status == 200 { range.lower } else { 0 };
        let mut download = RemoteDownload {
            skip,
            offset: range.lower,
            flushed: range.lower,
            buffer: BytesMut::new(),
        };

        let streamed = self.stream_body(range, response.body, &mut download, tx).await;
        // Whatever arrived before a failure is still worth keeping.
        if !download.buffer.is_empty() {
            let (packet, data) = download.take(download.buffer.len());
            self.persist(packet, data).await;
        }
        streamed?;

        if download.offset == range.lower {
            return Err(CacheError::EmptyNetworkResponse);
        }
        Ok(())
    }

    /// Forwards the body to the caller, persisting it one packet at a time.
    async fn stream_body(
        &self,
        range: ByteRange,
        mut body: ByteStream,
        download: &mut RemoteDownload,
        tx: &mpsc::Sender<Result<RangeEvent>>,
    ) -> Result<()> {
        let packet_limit = self.store.packet_limit().max(1);

        while download.offset < range.upper {
            let Some(chunk) = body.next().await else {
                break;
            };
            let mut chunk = chunk?;

            if download.skip > 0 {
                let n = download.skip.min(chunk.len() as u64);
                chunk = chunk.slice(n as usize..);
                download.skip -= n;
            }
            let remaining = range.upper - download.offset;
            if chunk.len() as u64 > remaining {
                chunk.truncate(remaining as usize);
            }
            if chunk.is_empty() {
                continue;
            }

            let offset = download.offset;
            download.offset += chunk.len() as u64;
            download.buffer.extend_from_slice(&chunk);
            self.flush(download, packet_limit).await;

            deliver(
                tx,
                RangeEvent::Data {
                    offset,
                    bytes: chunk,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Persists every full packet of the buffer.
    async fn flush(&self, download: &mut RemoteDownload, packet_limit: u64) {
        while download.buffer.len() as u64 >= packet_limit {
            let (packet, data) = download.take(packet_limit as usize);
            self.persist(packet, data).await;
        }
    }

    /// Writes one downloaded packet when admission and the checksum allow.
    /// Disk failures are logged; the bytes already reached the caller.
    async fn persist(&self, range: ByteRange, data: Bytes) {
        if self.options.use_checksum && !checksum::verify(&data, self.options.checksum_slice) {
            warn!(%range, "Payload failed checksum sampling, not persisted");
            return;
        }
        if !self.gate.allow_write() {
            debug!(%range, "Writes disallowed, payload not persisted");
            return;
        }

        let store = Arc::clone(&self.store);
        let result = blocking(move || {
            if store.write(&data, range)? {
                store.synchronize(true)?;
            }
            Ok(())
        })
        .await;

        if let Err(e) = result {
            warn!(%range, error = %e, "Failed to persist downloaded range");
        }
    }
}

/// Progress of one remote action.
struct RemoteDownload {
    /// Leading bytes of the body to drop.
    skip: u64,
    /// Next offset to deliver.
    offset: u64,
    /// Offset of the first buffered byte.
    flushed: u64,
    buffer: BytesMut,
}

impl RemoteDownload {
    /// Splits the first `len` buffered bytes off with the range they cover.
    fn take(&mut self, len: usize) -> (ByteRange, Bytes) {
        let data = self.buffer.split_to(len).freeze();
        let packet = ByteRange::with_len(self.flushed, len as u64);
        self.flushed += len as u64;
        (packet, data)
    }
}

async fn deliver(tx: &mpsc::Sender<Result<RangeEvent>>, event: RangeEvent) -> Result<()> {
    // A dropped receiver ends only this request.
    tx.send(Ok(event))
        .await
        .map_err(|_| CacheError::Cancelled)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::from(std::io::Error::other(e)))?
}
