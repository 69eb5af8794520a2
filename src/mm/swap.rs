//! Swap area.
//!
//! A bitmap over swap slots on a secondary block device; each slot holds
//! one page, which is eight sectors. Slots are claimed on write-out and
//! released either by the read that brings the page back or by the owner's
//! exit.

use super::{PAGE_SIZE, Page};
use crate::fs::bitmap::Bitmap;
use crate::fs::device::{BlockDevice, SECTOR_SIZE, Sector};
use crate::sync::SpinLock;
use std::sync::Arc;

/// Sectors per swap slot (one page).
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// The swap area over its backing device.
pub struct SwapArea {
    device: Arc<dyn BlockDevice>,
    slots: SpinLock<Bitmap>,
}

impl SwapArea {
    /// Creates a swap area covering all of `device`.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = device.sector_count() as usize / SECTORS_PER_PAGE;
        Self {
            device,
            slots: SpinLock::new(Bitmap::new(slot_count)),
        }
    }

    /// Number of page slots in the swap area.
    pub fn slot_count(&self) -> usize {
        let slots = self.slots.lock();
        let count = slots.len();
        slots.unlock();
        count
    }

    /// Whether `slot` is currently occupied.
    pub fn is_occupied(&self, slot: usize) -> bool {
        let slots = self.slots.lock();
        let set = slots.is_set(slot);
        slots.unlock();
        set
    }

    /// Writes `page` out to a free swap slot and returns its index, or
    /// `None` when the swap area is full.
    pub fn write_page(&self, page: &Page) -> Option<usize> {
        let slot = {
            let mut slots = self.slots.lock();
            let slot = slots.scan_and_set();
            slots.unlock();
            slot?
        };
        let base = (slot * SECTORS_PER_PAGE) as u32;
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &[u8; SECTOR_SIZE] = page.inner()[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            if self.device.write(Sector(base + i as u32), chunk).is_err() {
                panic!("swap: device write failed (slot {slot})");
            }
        }
        Some(slot)
    }

    /// Reads the page stored in `slot` into `page` and frees the slot.
    pub fn read_page(&self, slot: usize, page: &mut Page) {
        let base = (slot * SECTORS_PER_PAGE) as u32;
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &mut [u8; SECTOR_SIZE] = (&mut page.inner_mut()
                [i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            if self.device.read(Sector(base + i as u32), chunk).is_err() {
                panic!("swap: device read failed (slot {slot})");
            }
        }
        self.free_slot(slot);
    }

    /// Releases `slot` without reading it; used when the owning process
    /// exits with the page still swapped out.
    pub fn free_slot(&self, slot: usize) {
        let mut slots = self.slots.lock();
        slots.clear(slot);
        slots.unlock();
    }
}
