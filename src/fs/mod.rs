//! Filesystem core: block device seam, buffer cache, free-map, and the
//! indexed inode layer.
//!
//! The directory layer and path resolver are external collaborators; they
//! consume this module through [`FileSystem::open_inode`] and the
//! [`Inode`] read/write interface, storing directory entries as fixed-size
//! records inside directory-typed files.
//!
//! ## On-disk layout
//!
//! - Sector 0: the free-map inode, whose file data is the free-sector
//!   bitmap.
//! - Sector 1: the root directory inode.
//! - Every other sector is allocated on demand through the free-map.

pub mod bitmap;
pub mod cache;
pub mod device;
pub mod free_map;
pub mod inode;

pub use bitmap::Bitmap;
pub use cache::{BlockReadGuard, BlockWriteGuard, BufferCache, CACHE_SIZE, SlotKind};
pub use device::{BlockDevice, MemDisk, SECTOR_SIZE, Sector};
pub use free_map::FreeMap;
pub use inode::{Inode, InodeKind, MAX_FILE_SECTORS};

use crate::KernelError;
use crate::sync::SpinLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sector of the free-map inode.
pub const FREE_MAP_SECTOR: Sector = Sector(0);
/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: Sector = Sector(1);

/// A mounted filesystem: the device, its buffer cache, the free-map, and
/// the registry of open inodes.
///
/// The registry keeps at most one in-memory [`Inode`] per live sector;
/// opening an already-open sector returns the existing instance with its
/// open count raised.
pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    /// The buffer cache over the device.
    pub cache: BufferCache,
    /// The sector allocator.
    pub free_map: FreeMap,
    open_inodes: SpinLock<Vec<Arc<Inode>>>,
}

impl FileSystem {
    fn assemble(device: Arc<dyn BlockDevice>, flush_period: Duration) -> Self {
        Self {
            cache: BufferCache::with_flush_period(device.clone(), flush_period),
            free_map: FreeMap::new(device.sector_count()),
            open_inodes: SpinLock::new(Vec::new()),
            device,
        }
    }

    /// Creates a fresh filesystem on `device`: the free-map inode at
    /// sector 0 and an empty root directory inode at sector 1.
    pub fn format(device: Arc<dyn BlockDevice>) -> Self {
        Self::format_with(device, Duration::from_secs(10))
    }

    /// [`FileSystem::format`] with a custom periodic-flush interval.
    pub fn format_with(device: Arc<dyn BlockDevice>, flush_period: Duration) -> Self {
        info!(sectors = device.sector_count(), "fs: formatting device");
        let fs = Self::assemble(device, flush_period);
        fs.free_map.mark_used(FREE_MAP_SECTOR);
        fs.free_map.mark_used(ROOT_DIR_SECTOR);

        let bitmap_bytes = Bitmap::byte_len(fs.device.sector_count() as usize);
        assert!(
            fs.create_inode(FREE_MAP_SECTOR, bitmap_bytes, InodeKind::FreeMap),
            "format: failed to create the free-map inode"
        );
        assert!(
            fs.create_inode(ROOT_DIR_SECTOR, 0, InodeKind::Directory),
            "format: failed to create the root directory inode"
        );
        fs.free_map
            .flush(&fs)
            .expect("format: failed to persist the free-map");
        fs
    }

    /// Mounts an already formatted filesystem from `device`.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self, KernelError> {
        Self::mount_with(device, Duration::from_secs(10))
    }

    /// [`FileSystem::mount`] with a custom periodic-flush interval.
    pub fn mount_with(
        device: Arc<dyn BlockDevice>,
        flush_period: Duration,
    ) -> Result<Self, KernelError> {
        info!(sectors = device.sector_count(), "fs: mounting device");
        let fs = Self::assemble(device, flush_period);
        fs.free_map.load(&fs)?;
        Ok(fs)
    }

    /// Initializes an inode with `length` bytes of (unallocated) data at
    /// `sector`. Returns true on success.
    pub fn create_inode(&self, sector: Sector, length: usize, kind: InodeKind) -> bool {
        inode::write_new_inode(self, sector, length, kind);
        true
    }

    /// Opens the inode at `sector`, returning the registry's instance.
    pub fn open_inode(&self, sector: Sector) -> Result<Arc<Inode>, KernelError> {
        // Reading the on-disk inode may park, so learn the kind before
        // taking the registry lock; a racing open is resolved by the
        // re-check below.
        let kind = inode::read_inode_kind(self, sector)?;

        let mut list = self.open_inodes.lock();
        if let Some(existing) = list.iter().find(|i| i.sector() == sector) {
            let existing = existing.clone();
            existing.bump_open_count();
            list.unlock();
            return Ok(existing);
        }
        let inode = Arc::new(Inode::new(sector, kind));
        list.push(inode.clone());
        list.unlock();
        Ok(inode)
    }

    /// Closes one opener of `inode`.
    ///
    /// When the last opener of a removed inode closes it, every sector the
    /// inode references is released back to the free-map and dropped from
    /// the cache, followed by the inode sector itself.
    pub fn close_inode(&self, inode: Arc<Inode>) {
        let (last, removed) = {
            let mut list = self.open_inodes.lock();
            let (last, removed) = inode.drop_opener();
            if last {
                list.retain(|i| i.sector() != inode.sector());
            }
            list.unlock();
            (last, removed)
        };
        if last && removed {
            inode.release_chains(self);
        }
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        let this: &FileSystem = self;
        // Best effort: the cache flushes itself when dropped.
        let _ = this.free_map.flush(this);
    }
}
