//! Block device abstraction.
//!
//! The disk driver proper is an external collaborator; the core consumes
//! only its synchronous contract: reads and writes of exactly 512 bytes at
//! a 32-bit sector index. [`MemDisk`] backs tests and demos with an
//! in-memory sector array.

use crate::KernelError;
use crate::sync::SpinLock;

/// Size of a device sector in bytes, the access granularity of the disk.
pub const SECTOR_SIZE: usize = 512;

/// Sector, an index into the backing device.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub u32);

impl Sector {
    /// Get the byte offset on the device represented by this sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 as usize * SECTOR_SIZE
    }

    /// Cast into u32.
    #[inline]
    pub fn into_u32(self) -> u32 {
        self.0
    }
}

impl core::ops::Add<u32> for Sector {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

/// A device that stores an array of 512-byte sectors.
///
/// Any error from the device is fatal to the kernel; callers inside the
/// core either propagate the error to the collaborator layer or panic,
/// never retry.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors the device holds.
    fn sector_count(&self) -> u32;

    /// Read 512 bytes from the device starting at `sector`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Write 512 bytes to the device starting at `sector`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
}

/// An in-memory block device.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
    count: u32,
}

impl MemDisk {
    /// Creates a zero-filled in-memory device with `count` sectors.
    pub fn new(count: u32) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0; SECTOR_SIZE]; count as usize]),
            count,
        }
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u32 {
        self.count
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock();
        let Some(data) = sectors.get(sector.0 as usize) else {
            sectors.unlock();
            return Err(KernelError::IOError);
        };
        buf.copy_from_slice(data);
        sectors.unlock();
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock();
        let Some(data) = sectors.get_mut(sector.0 as usize) else {
            sectors.unlock();
            return Err(KernelError::IOError);
        };
        data.copy_from_slice(buf);
        sectors.unlock();
        Ok(())
    }
}
