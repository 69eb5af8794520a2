//! Supplemental page table.
//!
//! One per process: a map from page-aligned user virtual addresses to the
//! load origin of each page. The page-fault path looks the faulting
//! address up here (rounded down to its page) to decide how to fill the
//! frame; eviction updates entries in place as pages move to swap.

use super::Va;
use crate::fs::Inode;
use crate::sync::SpinLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where a page's contents live when it is not resident.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PageLocation {
    /// A zero-filled anonymous page.
    Zero,
    /// Read from a file, discarded when clean.
    Disk,
    /// In a swap slot.
    Swap,
    /// A stack page; always written to swap on eviction.
    Stack,
    /// A memory-mapped file page; written back to the file when dirty.
    Mmap,
}

/// A supplemental page table entry.
pub struct PageInfo {
    /// Page-aligned user virtual address of the page.
    pub va: Va,
    /// Load origin.
    pub location: PageLocation,
    /// Backing file for [`PageLocation::Disk`] and [`PageLocation::Mmap`].
    pub file: Option<Arc<Inode>>,
    /// Offset of the page's bytes within the backing file.
    pub file_offset: usize,
    /// Number of bytes to read from the file; the rest is zero-filled.
    pub page_bytes: usize,
    /// Whether the page may be written.
    pub writable: bool,
    /// Whether the page currently sits in a frame.
    pub loaded: bool,
    /// Occupied swap slot, when the contents are swapped out.
    pub swap_slot: Option<usize>,
}

/// Per-process supplemental page table.
pub struct SupplementalPageTable {
    entries: SpinLock<BTreeMap<Va, Arc<SpinLock<PageInfo>>>>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Records a page. Panics if the page is already recorded.
    pub fn insert(&self, info: PageInfo) -> Arc<SpinLock<PageInfo>> {
        let va = info.va.page_down();
        debug_assert_eq!(va, info.va, "SPT entries are keyed by page base");
        let entry = Arc::new(SpinLock::new(info));
        let mut entries = self.entries.lock();
        let prev = entries.insert(va, entry.clone());
        entries.unlock();
        assert!(prev.is_none(), "page {:#x} mapped twice", va.0);
        entry
    }

    /// Looks up the entry covering `va`, rounding down to the page base.
    pub fn lookup(&self, va: Va) -> Option<Arc<SpinLock<PageInfo>>> {
        let entries = self.entries.lock();
        let entry = entries.get(&va.page_down()).cloned();
        entries.unlock();
        entry
    }

    /// Removes and returns the entry covering `va`.
    pub fn remove(&self, va: Va) -> Option<Arc<SpinLock<PageInfo>>> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(&va.page_down());
        entries.unlock();
        entry
    }

    /// Removes and returns every entry; used at process exit.
    pub fn drain(&self) -> Vec<Arc<SpinLock<PageInfo>>> {
        let mut entries = self.entries.lock();
        let all = std::mem::take(&mut *entries).into_values().collect();
        entries.unlock();
        all
    }

    /// Number of recorded pages.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        let len = entries.len();
        entries.unlock();
        len
    }

    /// Whether no pages are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}
