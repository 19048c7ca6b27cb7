//! # File store
//!
//! Owns the data file of one resource. Turns a requested range into a plan of
//! local reads and remote fetches, performs the reads and writes, and keeps the
//! [`FragmentStore`] in step with what is on disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, Result};
use crate::paths::CachePaths;
use crate::range::ByteRange;
use crate::resource::{CacheFragment, ContentInfo, MediaResource};
use crate::store::configuration::FragmentStore;

/// Default ceiling for a single local I/O action.
pub const DEFAULT_PACKET_LIMIT: u64 = 1024 * 1024;

/// One step of a plan satisfying a requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Serve the range from the data file.
    Local(ByteRange),
    /// Fetch the range from the network.
    Remote(ByteRange),
}

impl Action {
    pub fn range(&self) -> ByteRange {
        match *self {
            Action::Local(range) | Action::Remote(range) => range,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Action::Local(_))
    }
}

/// Notifications published by stores and consumed by the cache manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A store flushed its data file and configuration.
    Synchronized(MediaResource),
    /// The host application returned to the foreground.
    Foreground,
}

/// Options controlling how a [`FileStore`] plans and admits writes.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Windows of the resource that may be persisted.
    pub cacheable_fragments: Vec<CacheFragment>,
    /// Maximum size of a single local action.
    pub packet_limit: u64,
    /// Place remote actions before local ones starting at the same offset.
    pub remote_first_on_tie: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cacheable_fragments: vec![CacheFragment::default()],
            packet_limit: DEFAULT_PACKET_LIMIT,
            remote_first_on_tie: false,
        }
    }
}

pub struct FileStore {
    resource: MediaResource,
    data_path: PathBuf,
    fragments: FragmentStore,
    options: StoreOptions,
    file: Mutex<Option<File>>,
    notifier: Option<broadcast::Sender<CacheEvent>>,
}

impl FileStore {
    /// Opens the data file and configuration of `resource`, creating both when
    /// missing, and reconciles the recorded fragments with the file on disk.
    pub fn open(
        paths: &CachePaths,
        resource: &MediaResource,
        options: StoreOptions,
        notifier: Option<broadcast::Sender<CacheEvent>>,
    ) -> Result<Self> {
        let data_path = paths.data_file(resource);
        debug!(path = ?data_path, "Opening media data file");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;
        let file_size = file.metadata()?.len();

        let fragments = FragmentStore::load_or_create(paths.config_file(resource), resource);

        let store = Self {
            resource: resource.clone(),
            data_path,
            fragments,
            options,
            file: Mutex::new(Some(file)),
            notifier,
        };
        store.reconcile(file_size)?;
        Ok(store)
    }

    /// Brings the fragment set in line with the actual size of the data file.
    fn reconcile(&self, file_size: u64) -> Result<()> {
        match self.fragments.max_upper() {
            None => {
                if file_size == 0 {
                    return Ok(());
                }
                // A complete file placed in the directory out of band.
                info!(key = %self.resource.cache_key(), size = file_size, "Adopting existing data file");
                self.fragments.set_reserved_length(file_size);
                self.fragments.add(ByteRange::new(0, file_size));
                if !self.fragments.synchronize() {
                    error!(key = %self.resource.cache_key(), "Configuration synchronize failed, deleting its data file");
                    self.fragments.reset(ByteRange::new(0, 0));
                    self.fragments.set_reserved_length(0);
                    if let Some(file) = self.file.lock().as_mut() {
                        file.set_len(0)?;
                    }
                    std::fs::remove_file(&self.data_path)?;
                    *self.file.lock() = None;
                }
            }
            Some(upper) if upper != file_size => {
                warn!(
                    key = %self.resource.cache_key(),
                    recorded = upper,
                    actual = file_size,
                    "Data file size disagrees with fragments, resetting"
                );
                self.fragments.reset(ByteRange::new(0, file_size));
                self.fragments.synchronize();
            }
            Some(_) => {}
        }
        Ok(())
    }

    pub fn resource(&self) -> &MediaResource {
        &self.resource
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Ceiling for a single local read or persisted packet.
    pub fn packet_limit(&self) -> u64 {
        self.options.packet_limit
    }

    pub fn fragments(&self) -> &FragmentStore {
        &self.fragments
    }

    pub fn content_info(&self) -> ContentInfo {
        self.fragments.content_info()
    }

    /// Records content info learned from the network and persists it.
    pub fn update_content_info(&self, info: ContentInfo) -> bool {
        if !self.fragments.update_content_info(info) {
            return false;
        }
        self.fragments.synchronize()
    }

    /// True until the total length of the resource is known.
    pub fn is_content_info_missing(&self) -> bool {
        self.fragments.content_info().is_missing()
    }

    /// Plans how to satisfy `range`: local reads for cached parts (split at the
    /// packet limit) and remote fetches for the gaps, ordered by offset.
    pub fn actions(&self, range: ByteRange) -> Vec<Action> {
        if !range.is_valid() {
            return Vec::new();
        }

        let local_ranges: Vec<ByteRange> = self
            .fragments
            .overlaps(&range)
            .iter()
            .filter_map(|hit| hit.clamped(&range))
            .flat_map(|hit| hit.split(self.options.packet_limit))
            .filter(ByteRange::is_valid)
            .collect();

        if local_ranges.is_empty() {
            return vec![Action::Remote(range)];
        }

        let remote_ranges = range.subtracting(&local_ranges);

        let mut actions: Vec<Action> = local_ranges.into_iter().map(Action::Local).collect();
        actions.extend(remote_ranges.into_iter().map(Action::Remote));

        let remote_first = self.options.remote_first_on_tie;
        actions.sort_by_key(|action| {
            let tie = action.is_local() == remote_first;
            (action.range().lower, tie)
        });
        actions
    }

    /// Reads `range` from the data file. Fewer bytes are returned only at the
    /// end of the file.
    pub fn read(&self, range: ByteRange) -> Result<Bytes> {
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| CacheError::from(std::io::Error::other("file store is closed")))?;

        // Open-ended ranges are bounded by what the file holds.
        let available = file.metadata()?.len().saturating_sub(range.lower);
        file.seek(SeekFrom::Start(range.lower))?;
        let mut buf = Vec::with_capacity(range.len().min(available) as usize);
        file.take(range.len()).read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Whether a write to `range` falls inside a cacheable window.
    pub fn is_cacheable(&self, range: &ByteRange) -> bool {
        let total_length = self.fragments.content_info().total_length;
        self.options
            .cacheable_fragments
            .iter()
            .any(|window| window.resolve(total_length).overlaps(range))
    }

    /// Writes `data` at `range.lower` and records the written range.
    ///
    /// Returns `false` when the range lies outside every cacheable window or
    /// the store is closed; nothing is written in that case.
    pub fn write(&self, data: &[u8], range: ByteRange) -> Result<bool> {
        let written = ByteRange::with_len(range.lower, data.len().min(range.len() as usize) as u64);
        if !written.is_valid() {
            return Ok(false);
        }

        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return Ok(false);
        };

        if !self.is_cacheable(&written) {
            debug!(key = %self.resource.cache_key(), range = %written, "Range outside cacheable fragments, not persisted");
            return Ok(false);
        }

        debug!(key = %self.resource.cache_key(), range = %written, "Write data");
        file.seek(SeekFrom::Start(written.lower))?;
        file.write_all(&data[..written.len() as usize])?;
        self.fragments.add(written);
        Ok(true)
    }

    /// Flushes the data file and persists the configuration. When `notify` is
    /// set a [`CacheEvent::Synchronized`] is published.
    pub fn synchronize(&self, notify: bool) -> Result<bool> {
        let guard = self.file.lock();
        let Some(file) = guard.as_ref() else {
            return Ok(false);
        };

        file.sync_all()?;
        let synced = self.fragments.synchronize();

        if notify {
            if let Some(notifier) = &self.notifier {
                // No subscribers is fine.
                let _ = notifier.send(CacheEvent::Synchronized(self.resource.clone()));
            }
        }
        Ok(synced)
    }

    /// Releases the file handle. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        if let Some(file) = self.file.lock().take() {
            file.sync_all()?;
            debug!(key = %self.resource.cache_key(), "Closed media data file");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = self.synchronize(false).and_then(|_| self.close()) {
            error!(key = %self.resource.cache_key(), error = %e, "File store synchronize and close failure");
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("resource", &self.resource)
            .field("data_path", &self.data_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(lower: u64, upper: u64) -> ByteRange {
        ByteRange::new(lower, upper)
    }

    fn resource() -> MediaResource {
        MediaResource::new("https://example.com/movie.mp4", Some("movie".into())).unwrap()
    }

    fn open(paths: &CachePaths, options: StoreOptions) -> FileStore {
        FileStore::open(paths, &resource(), options, None).unwrap()
    }

    fn covered_exactly(actions: &[Action], range: ByteRange) -> bool {
        let mut cursor = range.lower;
        for action in actions {
            if action.range().lower != cursor || !action.range().is_valid() {
                return false;
            }
            cursor = action.range().upper;
        }
        cursor == range.upper
    }

    #[test]
    fn test_actions_interleave_local_and_remote() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CachePaths::new(dir.path(), None);
        let store = open(&paths, StoreOptions::default());

        assert!(store.write(&[1u8; 1000], r(0, 1000)).unwrap());
        assert!(store.write(&[2u8; 1000], r(2000, 3000)).unwrap());

        let actions = store.actions(r(0, 3001));
        assert_eq!(
            actions,
            vec![
                Action::Local(r(0, 1000)),
                Action::Remote(r(1000, 2000)),
                Action::Local(r(2000, 3000)),
                Action::Remote(r(3000, 3001)),
            ]
        );
        assert!(covered_exactly(&actions, r(0, 3001)));
    }

    #[test]
    fn test_actions_without_coverage_is_single_remote() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&CachePaths::new(dir.path(), None), StoreOptions::default());
        assert_eq!(store.actions(r(10, 20)), vec![Action::Remote(r(10, 20))]);
        assert!(store.actions(r(20, 20)).is_empty());
        assert!(store.actions(r(30, 20)).is_empty());
    }

    #[test]
    fn test_actions_split_local_at_packet_limit() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            packet_limit: 100,
            ..StoreOptions::default()
        };
        let store = open(&CachePaths::new(dir.path(), None), options);
        store.write(&[7u8; 250], r(0, 250)).unwrap();

        let actions = store.actions(r(50, 400));
        assert_eq!(
            actions,
            vec![
                Action::Local(r(50, 150)),
                Action::Local(r(150, 250)),
                Action::Remote(r(250, 400)),
            ]
        );
        assert!(covered_exactly(&actions, r(50, 400)));
    }

    #[test]
    fn test_read_returns_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&CachePaths::new(dir.path(), None), StoreOptions::default());
        let payload: Vec<u8> = (0..=255u8).collect();
        store.write(&payload, r(100, 356)).unwrap();

        let read = store.read(r(110, 120)).unwrap();
        assert_eq!(&read[..], &payload[10..20]);

        // Short read at end of file.
        let tail = store.read(r(350, 400)).unwrap();
        assert_eq!(tail.len(), 6);

        let rest = store.read(r(300, u64::MAX)).unwrap();
        assert_eq!(&rest[..], &payload[200..]);
        assert!(store.read(r(1000, u64::MAX)).unwrap().is_empty());
    }

    #[test]
    fn test_write_outside_cacheable_window_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            cacheable_fragments: vec![CacheFragment::Prefix(100)],
            ..StoreOptions::default()
        };
        let store = open(&CachePaths::new(dir.path(), None), options);

        assert!(!store.write(&[1u8; 50], r(200, 250)).unwrap());
        assert!(store.fragments().fragments().is_empty());

        assert!(store.write(&[1u8; 50], r(80, 130)).unwrap());
        assert_eq!(store.fragments().fragments(), vec![r(80, 130)]);
    }

    #[test]
    fn test_reopen_resets_fragments_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CachePaths::new(dir.path(), None);
        {
            let store = open(&paths, StoreOptions::default());
            store.write(&[3u8; 4000], r(0, 4000)).unwrap();
            assert!(store.synchronize(false).unwrap());
        }

        let data_path = paths.data_file(&resource());
        let file = OpenOptions::new().write(true).open(&data_path).unwrap();
        file.set_len(1500).unwrap();
        drop(file);

        let store = open(&paths, StoreOptions::default());
        assert_eq!(store.fragments().fragments(), vec![r(0, 1500)]);
    }

    #[test]
    fn test_open_adopts_preexisting_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CachePaths::new(dir.path(), None);
        std::fs::write(paths.data_file(&resource()), vec![9u8; 2048]).unwrap();

        let store = open(&paths, StoreOptions::default());
        assert_eq!(store.fragments().fragments(), vec![r(0, 2048)]);
        assert_eq!(store.fragments().reserved_length(), 2048);
        assert_eq!(store.actions(r(0, 2048)), vec![Action::Local(r(0, 2048))]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&CachePaths::new(dir.path(), None), StoreOptions::default());
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(store.read(r(0, 1)).is_err());
        assert!(!store.write(&[0u8], r(0, 1)).unwrap());
        assert!(!store.synchronize(true).unwrap());
    }

    #[test]
    fn test_synchronize_notifies_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = broadcast::channel(4);
        let store = FileStore::open(
            &CachePaths::new(dir.path(), None),
            &resource(),
            StoreOptions::default(),
            Some(tx),
        )
        .unwrap();

        assert!(store.synchronize(false).unwrap());
        assert!(rx.try_recv().is_err());

        assert!(store.synchronize(true).unwrap());
        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Synchronized(resource()));
    }

    #[test]
    fn test_content_info_is_persisted_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CachePaths::new(dir.path(), None);
        let store = open(&paths, StoreOptions::default());
        assert!(store.is_content_info_missing());

        let info = ContentInfo {
            mime_type: Some("video/mp4".into()),
            total_length: 9000,
            supports_byte_range_access: true,
        };
        assert!(store.update_content_info(info.clone()));
        assert!(!store.is_content_info_missing());
        drop(store);

        let reopened = open(&paths, StoreOptions::default());
        assert_eq!(reopened.content_info(), info);
    }

    #[test]
    fn test_remote_first_tie_break() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            remote_first_on_tie: true,
            ..StoreOptions::default()
        };
        let store = open(&CachePaths::new(dir.path(), None), options);
        store.write(&[1u8; 10], r(0, 10)).unwrap();
        // Ties cannot occur between disjoint actions; ordering stays by offset.
        assert_eq!(
            store.actions(r(0, 20)),
            vec![Action::Local(r(0, 10)), Action::Remote(r(10, 20))]
        );
    }
}
