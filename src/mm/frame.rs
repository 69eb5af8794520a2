//! Frame table with two-handed clock eviction.
//!
//! One entry per physical user page. Each frame carries its own mutex,
//! which doubles as the I/O pin: any thread filling a frame or writing it
//! out holds the frame's lock, and the clock inspects frames only with a
//! non-blocking acquire, so a frame with I/O in flight can never be
//! selected for eviction.
//!
//! Two hands sweep the table in lockstep, the lead hand a quarter of the
//! table ahead of the lag hand. The lead hand clears accessed bits; the
//! lag hand evicts the first frame it finds whose page has not been
//! referenced since the lead hand passed it.
//!
//! Eviction writes the victim out according to its supplemental page table
//! entry: stack and swap pages always go to swap, zero and file-loaded
//! pages go to swap only when dirty, dirty mmap pages are written back to
//! their file, and everything else is discarded as re-fetchable. The
//! owner's page-table mapping is cleared before the frame is handed over.

use super::page_table::PageTable;
use super::spt::{PageInfo, PageLocation};
use super::swap::SwapArea;
use super::{Page, Va};
use crate::KernelError;
use crate::fs::FileSystem;
use crate::sync::{Mutex, MutexGuard, SpinLock};
use bitflags::bitflags;
use std::sync::Arc;
use tracing::{debug, warn};

bitflags! {
    /// Frame allocation flags.
    pub struct AllocFlags: u8 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Zero the frame before use.
        const ZERO = 1 << 1;
    }
}

pub(crate) struct FrameOwner {
    pub va: Va,
    pub info: Arc<SpinLock<PageInfo>>,
    pub pt: Arc<SpinLock<PageTable>>,
}

pub(crate) struct FrameData {
    pub page: Page,
    pub owner: Option<FrameOwner>,
}

struct Frame {
    lock: Mutex<FrameData>,
}

struct Hands {
    lead: usize,
    lag: usize,
    free: Vec<usize>,
}

/// The table of physical user pages.
pub struct FrameTable {
    frames: Vec<Frame>,
    hands: SpinLock<Hands>,
    pub(crate) swap: Arc<SwapArea>,
    pub(crate) fs: Option<Arc<FileSystem>>,
}

impl FrameTable {
    /// Creates a table of `frames` physical user pages backed by `swap`.
    ///
    /// `fs` is required only when file-backed pages will be mapped.
    pub fn new(frames: usize, swap: Arc<SwapArea>, fs: Option<Arc<FileSystem>>) -> Self {
        assert!(frames > 0, "frame table needs at least one frame");
        Self {
            frames: (0..frames)
                .map(|_| Frame {
                    lock: Mutex::new(FrameData {
                        page: Page::new(),
                        owner: None,
                    }),
                })
                .collect(),
            hands: SpinLock::new(Hands {
                lag: 0,
                lead: frames / 4,
                free: (0..frames).collect(),
            }),
            swap,
            fs,
        }
    }

    /// Number of frames in the table.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Obtains a frame for the page described by `info`, filling it from
    /// the entry's location and installing the owner's mapping before the
    /// pin is dropped.
    ///
    /// Evicts another page when no frame is free. Fails with
    /// [`KernelError::NoMemory`] when eviction needs swap and the swap
    /// area is full; the faulting process is expected to die of it.
    pub fn alloc_page(
        &self,
        flags: AllocFlags,
        va: Va,
        info: &Arc<SpinLock<PageInfo>>,
        pt: &Arc<SpinLock<PageTable>>,
    ) -> Result<usize, KernelError> {
        assert!(flags.contains(AllocFlags::USER));

        let free_idx = {
            let mut hands = self.hands.lock();
            let idx = hands.free.pop();
            hands.unlock();
            idx
        };
        let (idx, mut guard) = match free_idx {
            Some(idx) => (idx, self.frames[idx].lock.lock()),
            None => self.evict()?,
        };

        if flags.contains(AllocFlags::ZERO) {
            guard.page.inner_mut().fill(0);
        }

        guard.owner = Some(FrameOwner {
            va,
            info: info.clone(),
            pt: pt.clone(),
        });

        let mut info_g = info.lock();
        let writable = info_g.writable;
        match info_g.location {
            PageLocation::Zero | PageLocation::Stack => {
                guard.page.inner_mut().fill(0);
            }
            PageLocation::Swap => {
                let slot = info_g.swap_slot.take().expect("swapped page without a slot");
                self.swap.read_page(slot, &mut guard.page);
            }
            PageLocation::Disk | PageLocation::Mmap => {
                let fs = self
                    .fs
                    .as_ref()
                    .expect("file-backed page without a filesystem");
                let file = info_g.file.clone().expect("file-backed page without a file");
                let bytes = info_g.page_bytes;
                let offset = info_g.file_offset;
                let read = file.read_at(fs, &mut guard.page.inner_mut()[..bytes], offset);
                if read != bytes {
                    info_g.unlock();
                    guard.owner = None;
                    guard.unlock();
                    let mut hands = self.hands.lock();
                    hands.free.push(idx);
                    hands.unlock();
                    return Err(KernelError::IOError);
                }
                guard.page.inner_mut()[bytes..].fill(0);
            }
        }
        info_g.loaded = true;
        info_g.unlock();

        // Install the mapping while the frame is still pinned, so the
        // clock cannot reclaim it between fill and map.
        let mut pt_g = pt.lock();
        pt_g.map(va, idx, writable);
        pt_g.unlock();

        guard.unlock();
        Ok(idx)
    }

    /// Releases the frame at `idx` if it still belongs to `va`, clearing
    /// the owner's mapping. Returns false when the frame changed hands
    /// first (the page was evicted in the meantime).
    pub fn free_page(&self, idx: usize, va: Va, pt: &Arc<SpinLock<PageTable>>) -> bool {
        let mut guard = self.frames[idx].lock.lock();
        let owned = guard
            .owner
            .as_ref()
            .is_some_and(|o| o.va == va && Arc::ptr_eq(&o.pt, pt));
        if owned {
            let mut pt_g = pt.lock();
            pt_g.clear_page(va);
            pt_g.unlock();
            guard.owner = None;
            let mut hands = self.hands.lock();
            hands.free.push(idx);
            hands.unlock();
        }
        guard.unlock();
        owned
    }

    /// Runs `f` on the frame's page while holding its pin.
    pub fn with_frame<R>(&self, idx: usize, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut guard = self.frames[idx].lock.lock();
        let r = f(&mut guard.page);
        guard.unlock();
        r
    }

    /// Two-handed clock sweep. Returns the victim frame with its lock
    /// held.
    fn clock_find(&self) -> (usize, MutexGuard<'_, FrameData>) {
        let n = self.frames.len();
        let mut passes = 0usize;
        loop {
            let mut hands = self.hands.lock();
            let (lag, lead) = (hands.lag, hands.lead);

            if let Ok(guard) = self.frames[lag].lock.try_lock() {
                match &guard.owner {
                    None => guard.unlock(),
                    Some(owner) => {
                        let accessed = {
                            let pt = owner.pt.lock();
                            let accessed = pt.is_accessed(owner.va);
                            pt.unlock();
                            accessed
                        };
                        if !accessed {
                            hands.unlock();
                            return (lag, guard);
                        }
                        guard.unlock();
                    }
                }
            }

            // Give the lead hand's page its second chance window.
            if let Ok(lead_guard) = self.frames[lead].lock.try_lock() {
                if let Some(owner) = &lead_guard.owner {
                    let mut pt = owner.pt.lock();
                    pt.set_accessed(owner.va, false);
                    pt.unlock();
                }
                lead_guard.unlock();
            }

            hands.lag = (lag + 1) % n;
            hands.lead = (lead + 1) % n;
            hands.unlock();

            passes += 1;
            if passes % (2 * n) == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Evicts a page and returns its frame, still locked and with the
    /// owner cleared.
    fn evict(&self) -> Result<(usize, MutexGuard<'_, FrameData>), KernelError> {
        let (idx, mut guard) = self.clock_find();
        {
            let owner = guard.owner.as_ref().expect("clock selected an empty frame");
            let mut info = owner.info.lock();
            let dirty = {
                let pt = owner.pt.lock();
                let dirty = pt.is_dirty(owner.va);
                pt.unlock();
                dirty
            };

            let to_swap = matches!(info.location, PageLocation::Swap | PageLocation::Stack)
                || (matches!(info.location, PageLocation::Zero | PageLocation::Disk) && dirty);
            if to_swap {
                let Some(slot) = self.swap.write_page(&guard.page) else {
                    info.unlock();
                    guard.unlock();
                    warn!("frame eviction aborted: swap is full");
                    return Err(KernelError::NoMemory);
                };
                info.swap_slot = Some(slot);
                info.location = PageLocation::Swap;
            } else if info.location == PageLocation::Mmap && dirty {
                let fs = self
                    .fs
                    .as_ref()
                    .expect("mmap page without a filesystem");
                let file = info.file.clone().expect("mmap page without a file");
                let bytes = info.page_bytes;
                let offset = info.file_offset;
                file.write_at(fs, &guard.page.inner()[..bytes], offset);
            }
            debug!(va = owner.va.0, "frame: evicting page");

            // Unmap before the frame changes hands.
            let mut pt = owner.pt.lock();
            pt.clear_page(owner.va);
            pt.unlock();
            info.loaded = false;
            info.unlock();
        }
        guard.owner = None;
        Ok((idx, guard))
    }
}
