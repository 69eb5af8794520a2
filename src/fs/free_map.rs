//! Free-map: the allocator of device sectors.
//!
//! The free-map is a bitmap with one bit per device sector, kept in memory
//! for allocation decisions and persisted as the data of the freemap-kind
//! inode at sector 0. Persisting goes through the ordinary inode write
//! path, which itself allocates sectors on first flush; the flush loop
//! therefore repeats until the serialized form stops changing.

use super::bitmap::Bitmap;
use super::device::Sector;
use super::{FREE_MAP_SECTOR, FileSystem};
use crate::KernelError;
use crate::sync::SpinLock;

/// Bitmap of free device sectors.
pub struct FreeMap {
    bits: SpinLock<Bitmap>,
}

impl FreeMap {
    pub(crate) fn new(sectors: u32) -> Self {
        Self {
            bits: SpinLock::new(Bitmap::new(sectors as usize)),
        }
    }

    /// Allocates one free sector, or `None` if the device is full.
    pub fn allocate(&self) -> Option<Sector> {
        let mut bits = self.bits.lock();
        let pos = bits.scan_and_set();
        bits.unlock();
        pos.map(|pos| Sector(pos as u32))
    }

    /// Returns `sector` to the pool.
    pub fn release(&self, sector: Sector) {
        let mut bits = self.bits.lock();
        bits.clear(sector.0 as usize);
        bits.unlock();
    }

    /// Whether `sector` is currently allocated.
    pub fn is_allocated(&self, sector: Sector) -> bool {
        let bits = self.bits.lock();
        let set = bits.is_set(sector.0 as usize);
        bits.unlock();
        set
    }

    pub(crate) fn mark_used(&self, sector: Sector) {
        let mut bits = self.bits.lock();
        bits.try_set(sector.0 as usize);
        bits.unlock();
    }

    fn snapshot(&self) -> Vec<u8> {
        let bits = self.bits.lock();
        let bytes = bits.to_bytes();
        bits.unlock();
        bytes
    }

    /// Persists the bitmap through the free-map inode.
    ///
    /// The write itself may allocate data sectors for the free-map file,
    /// changing the bitmap; the loop re-serializes until a write observes
    /// no further change.
    pub fn flush(&self, fs: &FileSystem) -> Result<(), KernelError> {
        let inode = fs.open_inode(FREE_MAP_SECTOR)?;
        loop {
            let bytes = self.snapshot();
            if inode.write_at(fs, &bytes, 0) != bytes.len() {
                fs.close_inode(inode);
                return Err(KernelError::NoSpace);
            }
            if self.snapshot() == bytes {
                break;
            }
        }
        fs.close_inode(inode);
        Ok(())
    }

    /// Reloads the bitmap from the free-map inode.
    pub(crate) fn load(&self, fs: &FileSystem) -> Result<(), KernelError> {
        let inode = fs.open_inode(FREE_MAP_SECTOR)?;
        let len = {
            let bits = self.bits.lock();
            let len = bits.len();
            bits.unlock();
            len
        };
        let mut buf = vec![0u8; Bitmap::byte_len(len)];
        let read = inode.read_at(fs, &mut buf, 0);
        fs.close_inode(inode);
        if read != buf.len() {
            return Err(KernelError::FilesystemCorrupted("short free-map file"));
        }
        let mut bits = self.bits.lock();
        *bits = Bitmap::from_bytes(len, &buf);
        bits.unlock();
        Ok(())
    }
}
