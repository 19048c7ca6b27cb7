//! # Cache Manager
//!
//! Facade over one cache directory: capacity policy, write admission, the
//! set of resources being downloaded, and eviction through the
//! [`EvictionIndex`].

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capacity::FreeSpaceProbe;
use crate::config::CacheConfig;
use crate::download::WriteGate;
use crate::error::{CacheError, Result};
use crate::eviction::EvictionIndex;
use crate::paths::CachePaths;
use crate::resource::{CacheFragment, CacheKey, MediaResource};
use crate::store::{CacheEvent, Configuration, FileStore, StoreOptions};

const EVENT_CAPACITY: usize = 64;

/// State of the write admission flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAdmission {
    /// Initial value, never computed.
    Default(bool),
    /// Computed from free space against the capacity limit.
    Auto(bool),
    /// Pinned by the caller until reset.
    Manual(bool),
}

impl WriteAdmission {
    pub fn value(&self) -> bool {
        match *self {
            WriteAdmission::Default(v) | WriteAdmission::Auto(v) | WriteAdmission::Manual(v) => v,
        }
    }
}

pub struct CacheManager {
    config: CacheConfig,
    paths: CachePaths,
    capacity_limit: AtomicU64,
    index: EvictionIndex,
    /// Resources with active sessions and their session count.
    downloading: Mutex<HashMap<CacheKey, (MediaResource, usize)>>,
    /// Live file stores, one per resource.
    stores: Mutex<HashMap<CacheKey, Weak<FileStore>>>,
    admission: Mutex<WriteAdmission>,
    probe: Arc<dyn FreeSpaceProbe>,
    events: broadcast::Sender<CacheEvent>,
    last_usage_check: Mutex<Option<Instant>>,
}

impl CacheManager {
    /// Creates the cache directory, loads the eviction index and computes the
    /// initial write admission.
    pub fn new(config: CacheConfig, probe: Arc<dyn FreeSpaceProbe>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.directory)?;
        let paths = CachePaths::new(&config.directory, config.file_name_conversion.clone());

        let index = EvictionIndex::load_or_create(
            paths.eviction_index_file(),
            config.time_weight,
            config.use_weight,
        );
        if index.weights() != (config.time_weight, config.use_weight) {
            index.update_weights(config.time_weight, config.use_weight);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let manager = Arc::new(Self {
            capacity_limit: AtomicU64::new(config.capacity_limit),
            paths,
            index,
            downloading: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            admission: Mutex::new(WriteAdmission::Default(true)),
            probe,
            events,
            last_usage_check: Mutex::new(None),
            config,
        });
        manager.check_allow();

        info!(directory = ?manager.directory(), "Cache manager initialized");
        Ok(manager)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn directory(&self) -> &Path {
        self.paths.directory()
    }

    pub fn index(&self) -> &EvictionIndex {
        &self.index
    }

    /// File store of `resource`, wired to this manager's event bus.
    ///
    /// Every caller holding a store of the same cache key shares one instance,
    /// so a data file and its configuration have a single owner. The
    /// cacheable windows of the caller that opened it apply.
    pub fn open_store(
        &self,
        resource: &MediaResource,
        cacheable_fragments: Vec<CacheFragment>,
    ) -> Result<Arc<FileStore>> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(resource.cache_key()).and_then(Weak::upgrade) {
            debug!(key = %resource.cache_key(), "Sharing open file store");
            return Ok(store);
        }
        stores.retain(|_, store| store.strong_count() > 0);

        std::fs::create_dir_all(self.directory())?;
        let options = StoreOptions {
            cacheable_fragments,
            packet_limit: self.config.packet_limit,
            ..StoreOptions::default()
        };
        let store = Arc::new(FileStore::open(
            &self.paths,
            resource,
            options,
            Some(self.events.clone()),
        )?);
        stores.insert(resource.cache_key().to_string(), Arc::downgrade(&store));
        Ok(store)
    }

    /// Records a playback start of `resource`.
    pub fn visit(&self, resource: &MediaResource) {
        self.index.visit(resource);
    }

    pub fn add_downloading(&self, resource: &MediaResource) {
        let mut downloading = self.downloading.lock();
        let entry = downloading
            .entry(resource.cache_key().to_string())
            .or_insert_with(|| (resource.clone(), 0));
        entry.1 += 1;
        debug!(key = %resource.cache_key(), sessions = entry.1, "Resource downloading");
    }

    pub fn remove_downloading(&self, resource: &MediaResource) {
        let mut downloading = self.downloading.lock();
        if let Some(entry) = downloading.get_mut(resource.cache_key()) {
            entry.1 -= 1;
            if entry.1 == 0 {
                downloading.remove(resource.cache_key());
                debug!(key = %resource.cache_key(), "Resource no longer downloading");
            }
        }
    }

    pub fn downloading_resources(&self) -> Vec<MediaResource> {
        self.downloading
            .lock()
            .values()
            .map(|(resource, _)| resource.clone())
            .collect()
    }

    pub fn is_downloading(&self, cache_key: &str) -> bool {
        self.downloading.lock().contains_key(cache_key)
    }

    fn downloading_keys(&self) -> HashSet<CacheKey> {
        self.downloading.lock().keys().cloned().collect()
    }

    pub fn allow_write(&self) -> bool {
        self.admission.lock().value()
    }

    pub fn admission(&self) -> WriteAdmission {
        *self.admission.lock()
    }

    /// Pins the admission flag until [`reset_allow_write`](Self::reset_allow_write).
    pub fn set_allow_write(&self, allow: bool) {
        *self.admission.lock() = WriteAdmission::Manual(allow);
        info!(allow, "Write admission pinned");
    }

    /// Releases a pinned admission flag and recomputes it.
    pub fn reset_allow_write(&self) {
        {
            let mut admission = self.admission.lock();
            *admission = WriteAdmission::Default(admission.value());
        }
        self.check_allow();
    }

    pub fn capacity_limit(&self) -> u64 {
        self.capacity_limit.load(Ordering::Relaxed)
    }

    pub fn set_capacity_limit(&self, limit: u64) {
        self.capacity_limit.store(limit, Ordering::Relaxed);
        self.check_allow();
    }

    /// Recomputes write admission from free space unless pinned.
    pub fn check_allow(&self) {
        if !self.config.auto_check_usage {
            return;
        }
        let mut admission = self.admission.lock();
        if matches!(*admission, WriteAdmission::Manual(_)) {
            return;
        }

        let Some(available) = self.probe.available_space(self.directory()) else {
            debug!("Free space unknown, keeping write admission");
            return;
        };
        let allow = available > self.capacity_limit();
        if admission.value() != allow {
            info!(allow, available, capacity = self.capacity_limit(), "Write admission changed");
        }
        *admission = WriteAdmission::Auto(allow);
    }

    /// Total size of the files directly under the cache directory.
    pub fn calculate_size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in std::fs::read_dir(self.directory())? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    /// Evicts a batch of resources when usage exceeds the capacity limit.
    #[instrument(skip(self))]
    pub fn check_usage(&self) -> Result<()> {
        let size = self.calculate_size()?;
        let capacity = self.capacity_limit();
        if size <= capacity {
            return Ok(());
        }

        let victims = self
            .index
            .oldest_resources(self.config.max_eviction_batch, &self.downloading_keys());
        info!(size, capacity, victims = victims.len(), "Cache over capacity, evicting");

        for resource in victims {
            if let Err(e) = self.clean(&resource, true) {
                warn!(key = %resource.cache_key(), error = %e, "Failed to evict resource");
            }
        }
        Ok(())
    }

    /// Evicts one resource. With `reserve` and a recorded reserved length the
    /// data file is truncated to that prefix and only the configuration is
    /// removed; otherwise every file of the resource and its index entry go.
    #[instrument(skip(self, resource), fields(key = %resource.cache_key()))]
    pub fn clean(&self, resource: &MediaResource, reserve: bool) -> Result<()> {
        if self.is_downloading(resource.cache_key()) {
            return Err(CacheError::ResourceBusy(resource.cache_key().to_string()));
        }

        let config_path = self.paths.config_file(resource);
        let reserved = Configuration::read(&config_path)
            .map(|config| config.reserved_length)
            .unwrap_or(0);
        if !reserve || reserved == 0 {
            return self.full_clean(resource);
        }

        let data_path = self.paths.data_file(resource);
        let file = match OpenOptions::new().write(true).open(&data_path) {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "Cannot open data file for truncation");
                return self.full_clean(resource);
            }
        };
        remove_if_exists(&config_path)?;

        // Never grow a file shorter than its reservation.
        let truncated = file.metadata().and_then(|metadata| {
            let len = metadata.len().min(reserved);
            file.set_len(len)?;
            file.sync_all()?;
            Ok(len)
        });
        match truncated {
            Ok(len) => {
                info!(reserved, len, "Resource truncated to reserved prefix");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Truncation failed, removing resource");
                drop(file);
                self.full_clean(resource)
            }
        }
    }

    fn full_clean(&self, resource: &MediaResource) -> Result<()> {
        remove_if_exists(&self.paths.config_file(resource))?;
        remove_if_exists(&self.paths.data_file(resource))?;
        self.index.delete(resource.cache_key());
        info!(key = %resource.cache_key(), "Resource removed from cache");
        Ok(())
    }

    /// Removes everything except the files of resources being downloaded.
    #[instrument(skip(self))]
    pub fn clean_all(&self) -> Result<()> {
        let downloading = self.downloading_resources();

        if downloading.is_empty() {
            match std::fs::remove_dir_all(self.directory()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            std::fs::create_dir_all(self.directory())?;
            self.index.delete_all(&HashSet::new());
            info!("Cache directory recreated");
            return Ok(());
        }

        let mut keep: HashSet<String> = downloading
            .iter()
            .flat_map(|resource| {
                [
                    self.paths.data_file_name(resource),
                    self.paths.config_file_name(resource),
                ]
            })
            .collect();
        keep.insert(self.paths.eviction_index_file_name().to_string());

        for entry in std::fs::read_dir(self.directory())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                continue;
            }
            let path = entry.path();
            let removed = if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = ?path, error = %e, "Failed to remove cache entry");
            }
        }

        self.index.delete_all(&self.downloading_keys());
        info!(kept = downloading.len(), "Cache cleaned around active downloads");
        Ok(())
    }

    /// Persisted configuration of `cache_key`, if any.
    pub fn cached_resource(&self, cache_key: &str) -> Option<Configuration> {
        self.paths
            .find_config_file(cache_key)
            .and_then(|path| Configuration::read(&path))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Publishes an application foreground transition.
    pub fn notify_foreground(&self) {
        let _ = self.events.send(CacheEvent::Foreground);
    }

    /// Reacts to one cache event. Synchronization-driven checks run at most
    /// once per `usage_check_interval`.
    pub fn handle_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Foreground => self.check_allow(),
            CacheEvent::Synchronized(resource) => {
                if !self.config.auto_check_usage {
                    return;
                }
                {
                    let mut last = self.last_usage_check.lock();
                    if last.is_some_and(|at| at.elapsed() < self.config.usage_check_interval) {
                        return;
                    }
                    *last = Some(Instant::now());
                }
                debug!(key = %resource.cache_key(), "Usage check after synchronize");
                self.check_allow();
                if let Err(e) = self.check_usage() {
                    warn!(error = %e, "Usage check failed");
                }
            }
        }
    }

    /// Spawns a task feeding bus events to [`handle_event`](Self::handle_event)
    /// until the manager is dropped.
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.subscribe();
        let manager: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Cache event loop lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let handled =
                    tokio::task::spawn_blocking(move || manager.handle_event(&event)).await;
                if let Err(e) = handled {
                    warn!(error = %e, "Cache event handler panicked");
                }
            }
            debug!("Cache event loop stopped");
        })
    }
}

impl WriteGate for CacheManager {
    fn allow_write(&self) -> bool {
        CacheManager::allow_write(self)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("directory", &self.directory())
            .field("capacity_limit", &self.capacity_limit())
            .field("admission", &self.admission())
            .field("downloading", &self.downloading.lock().len())
            .finish()
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
