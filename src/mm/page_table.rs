//! Per-process page table model.
//!
//! Stands in for the hardware page table: one entry per mapped user page,
//! carrying the frame index and the present/writable/accessed/dirty bits
//! the eviction policy consults. The collaborator MMU would set the
//! accessed and dirty bits on real memory traffic; here they are set by
//! the access paths of [`super::vm::AddressSpace`].

use super::Va;
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Flags of a page table entry.
    pub struct PteFlags: u8 {
        /// The page is resident in a frame.
        const PRESENT = 1 << 0;
        /// The page may be written.
        const WRITABLE = 1 << 1;
        /// The page has been referenced since the bit was last cleared.
        const ACCESSED = 1 << 2;
        /// The page has been written since it was loaded.
        const DIRTY = 1 << 3;
    }
}

/// A page table entry.
#[derive(Debug, Clone, Copy)]
pub struct Pte {
    /// Index of the backing frame in the frame table.
    pub frame: usize,
    /// Entry flags.
    pub flags: PteFlags,
}

/// The page table of one process.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<Va, Pte>,
}

impl PageTable {
    /// Creates an empty page table.
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Installs a mapping from `va` to `frame`.
    pub fn map(&mut self, va: Va, frame: usize, writable: bool) {
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(va.page_down(), Pte { frame, flags });
    }

    /// Removes the mapping for `va`, returning the frame it pointed at.
    pub fn clear_page(&mut self, va: Va) -> Option<usize> {
        self.entries.remove(&va.page_down()).map(|pte| pte.frame)
    }

    /// Whether `va` is currently mapped.
    pub fn is_mapped(&self, va: Va) -> bool {
        self.entries.contains_key(&va.page_down())
    }

    /// The frame backing `va`, if mapped.
    pub fn frame_of(&self, va: Va) -> Option<usize> {
        self.entries.get(&va.page_down()).map(|pte| pte.frame)
    }

    /// Whether the mapping at `va` permits writes.
    pub fn is_writable(&self, va: Va) -> bool {
        self.entries
            .get(&va.page_down())
            .is_some_and(|pte| pte.flags.contains(PteFlags::WRITABLE))
    }

    /// Whether the accessed bit of `va` is set.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.entries
            .get(&va.page_down())
            .is_some_and(|pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    /// Sets or clears the accessed bit of `va`.
    pub fn set_accessed(&mut self, va: Va, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&va.page_down()) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    /// Whether the dirty bit of `va` is set.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.entries
            .get(&va.page_down())
            .is_some_and(|pte| pte.flags.contains(PteFlags::DIRTY))
    }

    /// Records a memory access to `va`, as the MMU would.
    pub fn mark_access(&mut self, va: Va, write: bool) {
        if let Some(pte) = self.entries.get_mut(&va.page_down()) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }
}
