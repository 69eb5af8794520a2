//! Buffer cache.
//!
//! A fixed array of 64 cache slots, each holding one 512-byte sector. A
//! single cache-map mutex protects the slot-to-sector mapping (membership,
//! allocation, and eviction decisions); a per-slot fair rw-lock protects
//! each payload. The locking order is cache-map lock first, then a per-slot
//! rw-lock, and the cache-map lock is never held while blocking on a slot
//! that may be waiting for it in turn.
//!
//! Eviction sweeps the metadata with a clock hand. Data slots are evicted
//! in preference to inode slots; an inode slot is taken only once the hand
//! has made a full revolution without finding an evictable data slot.
//! Victims are claimed with a non-blocking exclusive acquire, so a slot
//! pinned by in-flight I/O is simply skipped.
//!
//! Two background workers run for the lifetime of the cache: a read-ahead
//! worker that loads sectors enqueued by [`BufferCache::read_ahead_signal`],
//! and a periodic flusher that writes every dirty slot back (every ten
//! seconds by default). Both exit when the cache is dropped.
//!
//! Slot lifecycle: free -> loading -> clean <-> dirty -> evicting -> free.
//! The loading and evicting states hold the slot rw-lock exclusively;
//! clean and dirty permit shared holds.

use super::device::{BlockDevice, SECTOR_SIZE, Sector};
use crate::channel::{self, Sender};
use crate::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::thread::{JoinHandle, ThreadBuilder};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tracing::{debug, info};

/// Number of sectors that fit in the cache.
pub const CACHE_SIZE: usize = 64;

/// Capacity of the read-ahead request queue.
const READ_AHEAD_QUEUE: usize = 128;

/// Default interval between periodic flushes.
const FLUSH_PERIOD: Duration = Duration::from_secs(10);

/// Sector class, used as an eviction hint.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotKind {
    /// An inode sector; evicted only as a last resort.
    Inode,
    /// A data sector; preferred for eviction.
    Data,
}

/// Payload of one cache slot, protected by the slot's rw-lock.
struct SlotBuf {
    data: [u8; SECTOR_SIZE],
    /// Sector the payload belongs to; `None` while the slot is free. Used
    /// to revalidate a mapping read under the cache-map lock after the
    /// slot lock is finally acquired.
    sector: Option<Sector>,
    /// Set by writers, cleared by write-back. Atomic so that the flusher
    /// can clear it under a shared hold, as write-back does not mutate the
    /// payload.
    dirty: AtomicBool,
}

struct Slot {
    rw: RwLock<SlotBuf>,
}

#[derive(Clone, Copy)]
struct SlotMeta {
    sector: Option<Sector>,
    kind: SlotKind,
    accessed: bool,
}

struct CacheMap {
    meta: [SlotMeta; CACHE_SIZE],
    hand: usize,
    /// Slots passed over since the last eviction; once it reaches a full
    /// revolution the kind preference is abandoned.
    timeout: usize,
}

impl CacheMap {
    fn find(&self, sector: Sector) -> Option<usize> {
        self.meta.iter().position(|m| m.sector == Some(sector))
    }

    fn find_free(&self) -> Option<usize> {
        self.meta.iter().position(|m| m.sector.is_none())
    }

    fn advance(&mut self) {
        self.hand = (self.hand + 1) % CACHE_SIZE;
    }
}

struct CacheInner {
    device: Arc<dyn BlockDevice>,
    slots: Vec<Slot>,
    map: Mutex<CacheMap>,
}

enum Located<'a> {
    /// The sector is (probably) cached at this index; revalidate after
    /// locking.
    Hit(usize),
    /// The slot has been reserved for the sector and is held exclusively,
    /// but still carries stale bytes.
    Reserved(usize, RwLockWriteGuard<'a, SlotBuf>),
}

impl CacheInner {
    /// Finds or reserves a slot for `sector` under the cache-map lock.
    fn locate(&self, sector: Sector, kind: SlotKind) -> Located<'_> {
        let mut map = self.map.lock();

        if let Some(idx) = map.find(sector) {
            map.meta[idx].kind = kind;
            map.meta[idx].accessed = true;
            map.unlock();
            return Located::Hit(idx);
        }

        let (idx, guard) = match map.find_free() {
            Some(idx) => {
                // A free slot's rw-lock is contended only by transient
                // revalidators, which never block on the cache map, so a
                // blocking acquire here cannot deadlock.
                (idx, self.slots[idx].rw.write())
            }
            None => {
                let (idx, guard) = self.clock_find(&mut *map);
                // Write the victim back while the mapping change is still
                // invisible; releasing the map first would let a reader
                // reload the victim's sector from disk before the dirty
                // bytes land.
                if guard.dirty.load(Ordering::Acquire) {
                    let victim = guard.sector.expect("dirty slot without a sector");
                    debug!(victim = victim.0, "cache: evicting dirty slot");
                    if self.device.write(victim, &guard.data).is_err() {
                        panic!("buffer cache: device write failed (sector {})", victim.0);
                    }
                    guard.dirty.store(false, Ordering::Release);
                }
                (idx, guard)
            }
        };

        map.meta[idx] = SlotMeta {
            sector: Some(sector),
            kind,
            accessed: true,
        };
        map.unlock();

        let mut guard = guard;
        guard.sector = None;
        Located::Reserved(idx, guard)
    }

    /// Clock sweep over the metadata. Returns the victim index with its
    /// rw-lock held exclusively. Called with the cache-map lock held.
    fn clock_find<'a>(
        &'a self,
        map: &mut CacheMap,
    ) -> (usize, RwLockWriteGuard<'a, SlotBuf>) {
        loop {
            let idx = map.hand;
            let evictable = map.meta[idx].sector.is_some()
                && (map.meta[idx].kind == SlotKind::Data || map.timeout >= CACHE_SIZE);
            if evictable {
                if let Ok(guard) = self.slots[idx].rw.try_write() {
                    map.advance();
                    map.timeout = 0;
                    return (idx, guard);
                }
            }
            map.advance();
            map.timeout += 1;
            if map.timeout % (2 * CACHE_SIZE) == 0 {
                // Everything is pinned; give the holders a chance to run.
                std::thread::yield_now();
            }
        }
    }

    /// Loads `sector` from the device into a reserved slot.
    fn fill<'a>(
        &self,
        sector: Sector,
        mut guard: RwLockWriteGuard<'a, SlotBuf>,
    ) -> RwLockWriteGuard<'a, SlotBuf> {
        if self.device.read(sector, &mut guard.data).is_err() {
            panic!("buffer cache: device read failed (sector {})", sector.0);
        }
        guard.dirty.store(false, Ordering::Release);
        guard.sector = Some(sector);
        guard
    }

    fn get_shared(&self, sector: Sector, kind: SlotKind) -> BlockReadGuard<'_> {
        loop {
            match self.locate(sector, kind) {
                Located::Hit(idx) => {
                    let guard = self.slots[idx].rw.read();
                    if guard.sector == Some(sector) {
                        return BlockReadGuard { guard };
                    }
                    // The slot was recycled between the map lookup and the
                    // lock acquisition; look again.
                    drop(guard);
                    std::thread::yield_now();
                }
                Located::Reserved(_, guard) => {
                    return BlockReadGuard {
                        guard: self.fill(sector, guard).downgrade(),
                    };
                }
            }
        }
    }

    fn get_exclusive(&self, sector: Sector, kind: SlotKind) -> BlockWriteGuard<'_> {
        loop {
            match self.locate(sector, kind) {
                Located::Hit(idx) => {
                    let guard = self.slots[idx].rw.write();
                    if guard.sector == Some(sector) {
                        return BlockWriteGuard { guard };
                    }
                    drop(guard);
                    std::thread::yield_now();
                }
                Located::Reserved(_, guard) => {
                    return BlockWriteGuard {
                        guard: self.fill(sector, guard),
                    };
                }
            }
        }
    }

    /// Writes every dirty slot back to the device.
    ///
    /// Each slot is acquired shared; dirty slots are waited for rather than
    /// skipped. Flushing twice in a row is a no-op the second time.
    fn flush(&self) {
        for slot in &self.slots {
            let guard = slot.rw.read();
            if guard.dirty.load(Ordering::Acquire) {
                if let Some(sector) = guard.sector {
                    if self.device.write(sector, &guard.data).is_err() {
                        panic!("buffer cache: device write failed (sector {})", sector.0);
                    }
                    guard.dirty.store(false, Ordering::Release);
                }
            }
            drop(guard);
        }
    }

    /// Drops the slot caching `sector`, if any, without writing it back.
    ///
    /// Used when the sector itself is being released to the free-map, so
    /// its bytes no longer matter.
    fn free_slot(&self, sector: Sector) {
        loop {
            let mut map = self.map.lock();
            let Some(idx) = map.find(sector) else {
                map.unlock();
                return;
            };
            match self.slots[idx].rw.try_write() {
                Ok(mut guard) => {
                    guard.sector = None;
                    guard.dirty.store(false, Ordering::Release);
                    map.meta[idx].sector = None;
                    map.meta[idx].accessed = false;
                    map.unlock();
                    drop(guard);
                    return;
                }
                Err(_) => {
                    // The slot is held; retry once the holder is done.
                    map.unlock();
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Shared hold on a cached sector.
///
/// The payload may be read; the hold keeps the slot from being evicted or
/// reloaded under the reader.
pub struct BlockReadGuard<'a> {
    guard: RwLockReadGuard<'a, SlotBuf>,
}

impl<'a> BlockReadGuard<'a> {
    /// The cached 512 bytes.
    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.guard.data
    }

    /// Atomically converts this shared hold into an exclusive one.
    pub fn upgrade(self) -> BlockWriteGuard<'a> {
        BlockWriteGuard {
            guard: self.guard.upgrade(),
        }
    }
}

/// Exclusive hold on a cached sector.
pub struct BlockWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, SlotBuf>,
}

impl<'a> BlockWriteGuard<'a> {
    /// The cached 512 bytes.
    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.guard.data
    }

    /// Mutable access to the cached 512 bytes. Marks the slot dirty.
    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        self.guard.dirty.store(true, Ordering::Release);
        &mut self.guard.data
    }

    /// Atomically converts this exclusive hold into a shared one.
    pub fn downgrade(self) -> BlockReadGuard<'a> {
        BlockReadGuard {
            guard: self.guard.downgrade(),
        }
    }
}

/// The buffer cache over a block device.
///
/// See the module documentation for the locking and eviction discipline.
pub struct BufferCache {
    inner: Arc<CacheInner>,
    read_ahead: Option<Sender<Sector>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle>,
}

impl BufferCache {
    /// Creates a cache over `device` with the default flush period.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_flush_period(device, FLUSH_PERIOD)
    }

    /// Creates a cache over `device`, flushing every `period`.
    pub fn with_flush_period(device: Arc<dyn BlockDevice>, period: Duration) -> Self {
        let inner = Arc::new(CacheInner {
            device,
            slots: (0..CACHE_SIZE)
                .map(|_| Slot {
                    rw: RwLock::new(SlotBuf {
                        data: [0; SECTOR_SIZE],
                        sector: None,
                        dirty: AtomicBool::new(false),
                    }),
                })
                .collect(),
            map: Mutex::new(CacheMap {
                meta: [SlotMeta {
                    sector: None,
                    kind: SlotKind::Data,
                    accessed: false,
                }; CACHE_SIZE],
                // Start the hand a quarter of the way in, off the slots
                // that fill first.
                hand: CACHE_SIZE / 4,
                timeout: 0,
            }),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::channel(READ_AHEAD_QUEUE);

        let mut workers = Vec::new();
        {
            let inner = inner.clone();
            workers.push(ThreadBuilder::new("read-ahead").spawn(move || {
                info!("cache: read-ahead worker up");
                while let Ok(sector) = rx.recv() {
                    // Best effort: just pull the sector into the cache.
                    let _ = inner.get_shared(sector, SlotKind::Data);
                }
                info!("cache: read-ahead worker down");
            }));
        }
        {
            let inner = inner.clone();
            let shutdown = shutdown.clone();
            workers.push(ThreadBuilder::new("periodic-flush").spawn(move || {
                info!("cache: periodic flusher up");
                'outer: loop {
                    let mut waited = Duration::ZERO;
                    while waited < period {
                        if shutdown.load(Ordering::Acquire) {
                            break 'outer;
                        }
                        let step = Duration::from_millis(25).min(period - waited);
                        std::thread::sleep(step);
                        waited += step;
                    }
                    inner.flush();
                }
                info!("cache: periodic flusher down");
            }));
        }

        Self {
            inner,
            read_ahead: Some(tx),
            shutdown,
            workers,
        }
    }

    /// Get the block with `sector` into memory with a shared hold, whether
    /// by locating it in the cache or loading it from the device.
    pub fn get_shared(&self, sector: Sector, kind: SlotKind) -> BlockReadGuard<'_> {
        self.inner.get_shared(sector, kind)
    }

    /// Get the block with `sector` into memory with an exclusive hold.
    pub fn get_exclusive(&self, sector: Sector, kind: SlotKind) -> BlockWriteGuard<'_> {
        self.inner.get_exclusive(sector, kind)
    }

    /// Writes all dirty slots back to the device.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Drops the slot caching `sector`, if any, without write-back.
    pub fn free_slot(&self, sector: Sector) {
        self.inner.free_slot(sector);
    }

    /// Enqueues `sector` for asynchronous prefetch.
    ///
    /// Best effort: if the queue is full the request is dropped.
    pub fn read_ahead_signal(&self, sector: Sector) {
        if let Some(tx) = &self.read_ahead {
            let _ = tx.try_send(sector);
        }
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.inner.flush();
        self.shutdown.store(true, Ordering::Release);
        // Dropping the sender disconnects the read-ahead worker.
        self.read_ahead.take();
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}
