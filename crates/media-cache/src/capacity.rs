//! Free space queries used by the write admission policy.

use std::path::Path;

use sysinfo::Disks;
use tracing::trace;

/// Reports the free space available to a directory.
pub trait FreeSpaceProbe: Send + Sync {
    /// Free bytes on the volume holding `path`, `None` when unknown.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by the system disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpaceProbe for SystemFreeSpace {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        // The volume whose mount point is the longest prefix of the path.
        let disk = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())?;

        trace!(
            mount_point = ?disk.mount_point(),
            available = disk.available_space(),
            "Queried free space"
        );
        Some(disk.available_space())
    }
}

/// Probe returning a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct FixedFreeSpace(pub Option<u64>);

impl FreeSpaceProbe for FixedFreeSpace {
    fn available_space(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}
