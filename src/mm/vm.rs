//! Per-process address space: the supplemental page table and page table
//! wired to a shared frame table.
//!
//! The loader records pages here (zero, stack, file-backed, or mmap), and
//! the page-fault path resolves a faulting address to its entry, obtains a
//! frame, and installs the mapping. The access helpers stand in for user
//! memory traffic, faulting pages in on demand and maintaining the
//! accessed and dirty bits the eviction policy reads.

use super::frame::{AllocFlags, FrameTable};
use super::page_table::PageTable;
use super::spt::{PageInfo, PageLocation, SupplementalPageTable};
use super::{PAGE_SIZE, Va};
use crate::KernelError;
use crate::fs::Inode;
use crate::sync::SpinLock;
use std::sync::Arc;

/// The virtual memory state of one process.
pub struct AddressSpace {
    /// Where each page's contents live.
    pub spt: SupplementalPageTable,
    /// The process's page table model.
    pub page_table: Arc<SpinLock<PageTable>>,
    frames: Arc<FrameTable>,
}

impl AddressSpace {
    /// Creates an empty address space over the shared frame table.
    pub fn new(frames: Arc<FrameTable>) -> Self {
        Self {
            spt: SupplementalPageTable::new(),
            page_table: Arc::new(SpinLock::new(PageTable::new())),
            frames,
        }
    }

    /// Records a zero-filled anonymous page at `va`.
    pub fn map_zero(&self, va: Va, writable: bool) {
        self.spt.insert(PageInfo {
            va: va.page_down(),
            location: PageLocation::Zero,
            file: None,
            file_offset: 0,
            page_bytes: 0,
            writable,
            loaded: false,
            swap_slot: None,
        });
    }

    /// Records a stack page at `va`.
    pub fn map_stack(&self, va: Va) {
        self.spt.insert(PageInfo {
            va: va.page_down(),
            location: PageLocation::Stack,
            file: None,
            file_offset: 0,
            page_bytes: 0,
            writable: true,
            loaded: false,
            swap_slot: None,
        });
    }

    /// Records a file-loaded segment page at `va`: `page_bytes` bytes from
    /// `file` at `offset`, the rest zero.
    pub fn map_file(
        &self,
        va: Va,
        file: Arc<Inode>,
        offset: usize,
        page_bytes: usize,
        writable: bool,
    ) {
        debug_assert!(page_bytes <= PAGE_SIZE);
        self.spt.insert(PageInfo {
            va: va.page_down(),
            location: PageLocation::Disk,
            file: Some(file),
            file_offset: offset,
            page_bytes,
            writable,
            loaded: false,
            swap_slot: None,
        });
    }

    /// Records a memory-mapped file page at `va`; dirty evictions and
    /// unmap write it back to the file.
    pub fn map_mmap(&self, va: Va, file: Arc<Inode>, offset: usize, page_bytes: usize) {
        debug_assert!(page_bytes <= PAGE_SIZE);
        self.spt.insert(PageInfo {
            va: va.page_down(),
            location: PageLocation::Mmap,
            file: Some(file),
            file_offset: offset,
            page_bytes,
            writable: true,
            loaded: false,
            swap_slot: None,
        });
    }

    /// Whether `va` currently sits in a frame.
    pub fn is_resident(&self, va: Va) -> bool {
        let pt = self.page_table.lock();
        let mapped = pt.is_mapped(va);
        pt.unlock();
        mapped
    }

    /// Handles a page fault at `va`.
    ///
    /// Looks the page up in the supplemental page table, rejects writes to
    /// read-only pages, and otherwise pulls the page into a frame. Errors
    /// kill the faulting process in the collaborator layer.
    pub fn page_fault(&self, va: Va, write: bool) -> Result<(), KernelError> {
        let va = va.page_down();
        let info = self.spt.lookup(va).ok_or(KernelError::InvalidAccess)?;
        {
            let info_g = info.lock();
            let ok = !write || info_g.writable;
            info_g.unlock();
            if !ok {
                return Err(KernelError::InvalidAccess);
            }
        }
        if self.is_resident(va) {
            // A benign refault: another thread brought the page in first.
            return Ok(());
        }
        self.frames
            .alloc_page(AllocFlags::USER, va, &info, &self.page_table)?;
        Ok(())
    }

    /// Performs one user access to `va`, faulting the page in if needed
    /// and maintaining the accessed/dirty bits.
    pub fn touch(&self, va: Va, write: bool) -> Result<(), KernelError> {
        if !self.is_resident(va) {
            self.page_fault(va, write)?;
        }
        let mut pt = self.page_table.lock();
        if write && !pt.is_writable(va) {
            pt.unlock();
            return Err(KernelError::InvalidAccess);
        }
        pt.mark_access(va, write);
        pt.unlock();
        Ok(())
    }

    /// Reads one byte of user memory.
    pub fn read_byte(&self, va: Va) -> Result<u8, KernelError> {
        self.touch(va, false)?;
        let frame = self.frame_of(va).ok_or(KernelError::BadAddress)?;
        Ok(self
            .frames
            .with_frame(frame, |page| page.inner()[va.page_offset()]))
    }

    /// Writes one byte of user memory.
    pub fn write_byte(&self, va: Va, value: u8) -> Result<(), KernelError> {
        self.touch(va, true)?;
        let frame = self.frame_of(va).ok_or(KernelError::BadAddress)?;
        self.frames
            .with_frame(frame, |page| page.inner_mut()[va.page_offset()] = value);
        Ok(())
    }

    fn frame_of(&self, va: Va) -> Option<usize> {
        let pt = self.page_table.lock();
        let frame = pt.frame_of(va);
        pt.unlock();
        frame
    }

    /// Unmaps the page at `va`, writing a dirty mmap page back to its
    /// file, and forgets it.
    ///
    /// The entry's state is snapshotted before any frame lock is taken;
    /// a concurrent eviction is detected through [`FrameTable::free_page`]
    /// and resolved by releasing the swap slot it left behind.
    pub fn unmap(&self, va: Va) -> Result<(), KernelError> {
        let va = va.page_down();
        let info = self.spt.remove(va).ok_or(KernelError::InvalidArgument)?;

        let (loaded, location, file, offset, bytes, slot) = {
            let info_g = info.lock();
            let snap = (
                info_g.loaded,
                info_g.location,
                info_g.file.clone(),
                info_g.file_offset,
                info_g.page_bytes,
                info_g.swap_slot,
            );
            info_g.unlock();
            snap
        };

        if loaded {
            let dirty = {
                let pt = self.page_table.lock();
                let dirty = pt.is_dirty(va);
                pt.unlock();
                dirty
            };
            if location == PageLocation::Mmap && dirty {
                let fs = self
                    .frames
                    .fs
                    .as_ref()
                    .expect("mmap page without a filesystem");
                let file = file.expect("mmap page without a file");
                if let Some(frame) = self.frame_of(va) {
                    self.frames.with_frame(frame, |page| {
                        file.write_at(fs, &page.inner()[..bytes], offset);
                    });
                }
            }
            if !self
                .frame_of(va)
                .is_some_and(|frame| self.frames.free_page(frame, va, &self.page_table))
            {
                self.release_swap_slot(&info);
            }
        } else if let Some(slot) = slot {
            self.frames.swap.free_slot(slot);
        }
        Ok(())
    }

    fn release_swap_slot(&self, info: &Arc<SpinLock<PageInfo>>) {
        let mut info_g = info.lock();
        if let Some(slot) = info_g.swap_slot.take() {
            self.frames.swap.free_slot(slot);
        }
        info_g.unlock();
    }

    /// Tears the address space down: frees resident frames and occupied
    /// swap slots, and forgets every page. Called at process exit.
    pub fn exit(&self) {
        for info in self.spt.drain() {
            let (va, loaded, slot) = {
                let info_g = info.lock();
                let snap = (info_g.va, info_g.loaded, info_g.swap_slot);
                info_g.unlock();
                snap
            };
            if loaded {
                if !self
                    .frame_of(va)
                    .is_some_and(|frame| self.frames.free_page(frame, va, &self.page_table))
                {
                    // Evicted between the snapshot and the free; the page
                    // now lives in swap.
                    self.release_swap_slot(&info);
                }
            } else if let Some(slot) = slot {
                self.frames.swap.free_slot(slot);
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.exit();
    }
}
