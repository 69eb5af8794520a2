//! Multi-level indexed inode.
//!
//! An inode maps a position within a file to the disk sector holding its
//! bytes through a tiered indexing scheme: the on-disk inode sector carries
//! 123 direct sector pointers, one indirect pointer (a sector of 128 more
//! pointers), and one doubly indirect pointer (a sector of pointers to
//! indirect sectors). The maximum file size is therefore
//! 123 + 128 + 128 * 128 = 16,635 sectors, about 8.3 MB.
//!
//! All metadata accesses go through the buffer cache. Translation holds at
//! most one slot at a time: each level's slot is shared-acquired, the
//! pointer extracted, and the slot released before the next level is
//! loaded. Growth holds the inode sector exclusively for the entire pointer
//! installation, which makes the length and the sector chain change
//! atomically with respect to readers; when an index level and its child
//! must be held together, the level closer to the inode is acquired first.
//!
//! Files are sparse only at the tail: writing past end-of-file first fills
//! the gap with freshly allocated zero sectors, so every byte below the
//! length is backed by a real sector. Reads past end-of-file, or of a block
//! whose pointer is missing, return the bytes read so far.

use super::FileSystem;
use super::cache::SlotKind;
use super::device::{SECTOR_SIZE, Sector};
use crate::KernelError;
use crate::sync::SpinLock;
use num_enum::TryFromPrimitive;
use zerocopy::{AsBytes, FromBytes};

/// Number of direct sector pointers in an inode sector.
pub const DIRECT_BLOCKS: usize = 123;
/// Index of the indirect pointer in the `sectors` array.
const INDIRECT_IDX: usize = DIRECT_BLOCKS;
/// Index of the doubly indirect pointer in the `sectors` array.
const DOUBLY_IDX: usize = DIRECT_BLOCKS + 1;
/// Number of sector pointers per indirect sector.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;
/// Number of pointer slots in an inode sector.
const INODE_SECTORS: usize = DIRECT_BLOCKS + 2;
/// Largest number of data sectors a single file can reference.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_BLOCKS + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Identifies an inode sector.
const INODE_MAGIC: u32 = 0x494e4f44;

/// Raw encoding of a missing sector pointer.
const RAW_MISSING: u32 = u32::MAX;

/// The role of an inode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum InodeKind {
    /// The free-map inode at sector 0.
    FreeMap = 0,
    /// A regular file.
    File = 1,
    /// A directory-typed file.
    Directory = 2,
}

/// On-disk inode. Must be exactly one sector long.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct DiskInode {
    /// File size in bytes.
    length: i32,
    /// Magic number.
    magic: u32,
    /// [`InodeKind`] as a raw value.
    kind: u32,
    /// Disk locations of data: first [`DIRECT_BLOCKS`] are direct, then the
    /// indirect sector, then the doubly indirect sector.
    sectors: [u32; INODE_SECTORS],
}
const_assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

/// An indirect sector: an array of sector pointers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct IndirectBlock {
    sectors: [u32; PTRS_PER_SECTOR],
}
const_assert!(core::mem::size_of::<IndirectBlock>() == SECTOR_SIZE);

impl DiskInode {
    fn decode(bytes: &[u8; SECTOR_SIZE]) -> Self {
        let mut di = Self::new_zeroed();
        di.as_bytes_mut().copy_from_slice(bytes);
        di
    }

    fn slot(&self, idx: usize) -> Option<Sector> {
        match self.sectors[idx] {
            RAW_MISSING => None,
            raw => Some(Sector(raw)),
        }
    }

    fn set_slot(&mut self, idx: usize, sector: Sector) {
        self.sectors[idx] = sector.0;
    }
}

impl IndirectBlock {
    fn decode(bytes: &[u8; SECTOR_SIZE]) -> Self {
        let mut ib = Self::new_zeroed();
        ib.as_bytes_mut().copy_from_slice(bytes);
        ib
    }

    fn empty() -> Self {
        Self {
            sectors: [RAW_MISSING; PTRS_PER_SECTOR],
        }
    }

    fn slot(&self, idx: usize) -> Option<Sector> {
        match self.sectors[idx] {
            RAW_MISSING => None,
            raw => Some(Sector(raw)),
        }
    }

    fn first_missing(&self) -> Option<usize> {
        self.sectors.iter().position(|&raw| raw == RAW_MISSING)
    }
}

struct InodeState {
    open_count: usize,
    deny_write_count: usize,
    removed: bool,
}

/// An in-memory inode.
///
/// For any live inode sector there is at most one in-memory inode; opening
/// a sector that is already open returns the existing instance with its
/// open count raised. Instances are handed out by
/// [`FileSystem::open_inode`] and given back with
/// [`FileSystem::close_inode`].
pub struct Inode {
    sector: Sector,
    kind: InodeKind,
    state: SpinLock<InodeState>,
}

impl Inode {
    pub(crate) fn new(sector: Sector, kind: InodeKind) -> Self {
        Self {
            sector,
            kind,
            state: SpinLock::new(InodeState {
                open_count: 1,
                deny_write_count: 0,
                removed: false,
            }),
        }
    }

    /// The sector holding this inode's on-disk form.
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// The role of this inode.
    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    /// Number of openers of this inode.
    pub fn open_count(&self) -> usize {
        let st = self.state.lock();
        let count = st.open_count;
        st.unlock();
        count
    }

    pub(crate) fn bump_open_count(&self) {
        let mut st = self.state.lock();
        st.open_count += 1;
        st.unlock();
    }

    /// Decrements the open count; returns true when it reached zero,
    /// together with whether the inode was marked removed.
    pub(crate) fn drop_opener(&self) -> (bool, bool) {
        let mut st = self.state.lock();
        debug_assert!(st.open_count > 0);
        st.open_count -= 1;
        let last = st.open_count == 0;
        let removed = st.removed;
        st.unlock();
        (last, removed)
    }

    /// Marks the inode to be deleted when the last opener closes it.
    pub fn remove(&self) {
        let mut st = self.state.lock();
        st.removed = true;
        st.unlock();
    }

    /// Whether the inode is marked removed.
    pub fn is_removed(&self) -> bool {
        let st = self.state.lock();
        let removed = st.removed;
        st.unlock();
        removed
    }

    /// Disables writes to this inode.
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut st = self.state.lock();
        st.deny_write_count += 1;
        debug_assert!(st.deny_write_count <= st.open_count);
        st.unlock();
    }

    /// Re-enables writes to this inode.
    /// Must be called once by each opener that called [`Inode::deny_write`]
    /// before closing the inode.
    pub fn allow_write(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.deny_write_count > 0);
        st.deny_write_count -= 1;
        st.unlock();
    }

    /// The length, in bytes, of this inode's data.
    pub fn length(&self, fs: &FileSystem) -> usize {
        let g = fs.cache.get_shared(self.sector, SlotKind::Inode);
        let di = DiskInode::decode(g.bytes());
        di.length.max(0) as usize
    }

    /// Returns the disk sector that contains byte offset `pos`, or `None`
    /// if no sector backs that offset.
    fn byte_to_sector(&self, fs: &FileSystem, pos: usize) -> Option<Sector> {
        let block_index = pos / SECTOR_SIZE;

        let inode_guard = fs.cache.get_shared(self.sector, SlotKind::Inode);
        let di = DiskInode::decode(inode_guard.bytes());

        if block_index < DIRECT_BLOCKS {
            di.slot(block_index)
        } else if block_index < DIRECT_BLOCKS + PTRS_PER_SECTOR {
            let i_sector = di.slot(INDIRECT_IDX);
            drop(inode_guard);
            let i_sector = i_sector?;

            let ig = fs.cache.get_shared(i_sector, SlotKind::Data);
            let ib = IndirectBlock::decode(ig.bytes());
            ib.slot(block_index - DIRECT_BLOCKS)
        } else if block_index < MAX_FILE_SECTORS {
            let d_sector = di.slot(DOUBLY_IDX);
            drop(inode_guard);
            let d_sector = d_sector?;

            let rel = block_index - DIRECT_BLOCKS - PTRS_PER_SECTOR;
            let dg = fs.cache.get_shared(d_sector, SlotKind::Data);
            let db = IndirectBlock::decode(dg.bytes());
            let i_sector = db.slot(rel / PTRS_PER_SECTOR);
            drop(dg);
            let i_sector = i_sector?;

            let ig = fs.cache.get_shared(i_sector, SlotKind::Data);
            let ib = IndirectBlock::decode(ig.bytes());
            ib.slot(rel % PTRS_PER_SECTOR)
        } else {
            None
        }
    }

    /// Reads up to `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes actually read, which may be less than
    /// requested when end of file is reached. Reading a block also enqueues
    /// a prefetch of its successor.
    pub fn read_at(&self, fs: &FileSystem, buf: &mut [u8], offset: usize) -> usize {
        let mut bytes_read = 0;
        let mut offset = offset;
        let mut size = buf.len();

        while size > 0 {
            let Some(sector) = self.byte_to_sector(fs, offset) else {
                return bytes_read;
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = self.length(fs).saturating_sub(offset);
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(inode_left).min(sector_left);
            if chunk == 0 {
                return bytes_read;
            }

            {
                let g = fs.cache.get_shared(sector, SlotKind::Data);
                buf[bytes_read..bytes_read + chunk]
                    .copy_from_slice(&g.bytes()[sector_ofs..sector_ofs + chunk]);
            }

            size -= chunk;
            offset += chunk;
            bytes_read += chunk;

            // Pre-load the next data block asynchronously while the caller
            // consumes this one.
            if size > 0 {
                if let Some(next) = self.byte_to_sector(fs, offset) {
                    fs.cache.read_ahead_signal(next);
                }
            }
        }

        bytes_read
    }

    /// Writes `buf` at `offset`, growing the file as needed.
    ///
    /// Returns the number of bytes written, which may be less than
    /// `buf.len()` if the free-map runs out. A write past end of file first
    /// fills the gap with zeroed sectors, so the bytes in between read back
    /// as zero. Returns 0 while writes are denied.
    pub fn write_at(&self, fs: &FileSystem, buf: &[u8], offset: usize) -> usize {
        {
            let st = self.state.lock();
            let denied = st.deny_write_count > 0;
            st.unlock();
            if denied {
                return 0;
            }
        }

        let length = self.length(fs);
        if offset > length && self.write_zeros(fs, length, offset) < offset - length {
            return 0;
        }

        let mut written = 0;
        let mut offset = offset;
        let mut size = buf.len();

        while size > 0 {
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = size.min(SECTOR_SIZE - sector_ofs);

            match self.byte_to_sector(fs, offset) {
                Some(sector) => {
                    {
                        let mut w = fs.cache.get_exclusive(sector, SlotKind::Data);
                        w.bytes_mut()[sector_ofs..sector_ofs + chunk]
                            .copy_from_slice(&buf[written..written + chunk]);
                    }
                    self.update_length(fs, offset + chunk);
                }
                None => {
                    let Some(new_sector) = fs.free_map.allocate() else {
                        return written;
                    };
                    {
                        let mut w = fs.cache.get_exclusive(new_sector, SlotKind::Data);
                        let bytes = w.bytes_mut();
                        bytes.fill(0);
                        bytes[sector_ofs..sector_ofs + chunk]
                            .copy_from_slice(&buf[written..written + chunk]);
                    }
                    if !self.install_block(fs, new_sector, offset + chunk) {
                        fs.free_map.release(new_sector);
                        fs.cache.free_slot(new_sector);
                        return written;
                    }
                }
            }

            size -= chunk;
            offset += chunk;
            written += chunk;
        }

        written
    }

    /// Fills `[from, to)` with zeroed sectors, extending the length as it
    /// goes. Returns the number of bytes covered.
    fn write_zeros(&self, fs: &FileSystem, from: usize, to: usize) -> usize {
        let mut cur = from;
        while cur < to {
            let chunk = (SECTOR_SIZE - cur % SECTOR_SIZE).min(to - cur);
            if self.byte_to_sector(fs, cur).is_none() {
                let Some(new_sector) = fs.free_map.allocate() else {
                    return cur - from;
                };
                {
                    let mut w = fs.cache.get_exclusive(new_sector, SlotKind::Data);
                    w.bytes_mut().fill(0);
                }
                if !self.install_block(fs, new_sector, cur + chunk) {
                    fs.free_map.release(new_sector);
                    fs.cache.free_slot(new_sector);
                    return cur - from;
                }
            } else {
                // The tail of the last allocated sector; already zero since
                // sectors are zero-filled on allocation.
                self.update_length(fs, cur + chunk);
            }
            cur += chunk;
        }
        to - from
    }

    /// Extends the recorded length to at least `end`.
    fn update_length(&self, fs: &FileSystem, end: usize) {
        let mut w = fs.cache.get_exclusive(self.sector, SlotKind::Inode);
        let mut di = DiskInode::decode(w.bytes());
        if (di.length.max(0) as usize) < end {
            di.length = end as i32;
            w.bytes_mut().copy_from_slice(di.as_bytes());
        }
    }

    /// Installs a freshly allocated data sector into the pointer tree and
    /// extends the length to `end`.
    ///
    /// The inode sector is held exclusively for the whole installation, so
    /// the length and the chain move together. On failure every
    /// temporarily held cache slot has been released and the length is
    /// untouched; index sectors allocated along the way stay recorded.
    fn install_block(&self, fs: &FileSystem, new_sector: Sector, end: usize) -> bool {
        let mut w = fs.cache.get_exclusive(self.sector, SlotKind::Inode);
        let mut di = DiskInode::decode(w.bytes());
        let added = add_block(fs, &mut di, new_sector);
        if added && (di.length.max(0) as usize) < end {
            di.length = end as i32;
        }
        w.bytes_mut().copy_from_slice(di.as_bytes());
        added
    }

    /// Releases every sector this inode references back to the free-map,
    /// dropping their cache slots. Called when the last opener closes a
    /// removed inode.
    pub(crate) fn release_chains(&self, fs: &FileSystem) {
        let di = {
            let g = fs.cache.get_shared(self.sector, SlotKind::Inode);
            DiskInode::decode(g.bytes())
        };

        // Pointers are installed densely, so the first missing entry ends
        // each chain.
        for idx in 0..DIRECT_BLOCKS {
            match di.slot(idx) {
                Some(sector) => free_block(fs, sector),
                None => break,
            }
        }

        if let Some(i_sector) = di.slot(INDIRECT_IDX) {
            release_indirect(fs, i_sector);
        }

        if let Some(d_sector) = di.slot(DOUBLY_IDX) {
            let db = {
                let g = fs.cache.get_shared(d_sector, SlotKind::Data);
                IndirectBlock::decode(g.bytes())
            };
            for idx in 0..PTRS_PER_SECTOR {
                match db.slot(idx) {
                    Some(child) => release_indirect(fs, child),
                    None => break,
                }
            }
            free_block(fs, d_sector);
        }

        free_block(fs, self.sector);
    }
}

fn release_indirect(fs: &FileSystem, i_sector: Sector) {
    let ib = {
        let g = fs.cache.get_shared(i_sector, SlotKind::Data);
        IndirectBlock::decode(g.bytes())
    };
    for idx in 0..PTRS_PER_SECTOR {
        match ib.slot(idx) {
            Some(sector) => free_block(fs, sector),
            None => break,
        }
    }
    free_block(fs, i_sector);
}

fn free_block(fs: &FileSystem, sector: Sector) {
    fs.cache.free_slot(sector);
    fs.free_map.release(sector);
}

/// Adds a newly allocated data sector to the inode's pointer tree,
/// allocating indirect and doubly indirect sectors lazily as needed.
///
/// The caller holds the inode sector exclusively. Returns false if the
/// tree is full or the free-map is exhausted; index sectors allocated
/// before the failure remain recorded in `di`.
fn add_block(fs: &FileSystem, di: &mut DiskInode, new_sector: Sector) -> bool {
    // A direct slot, if one is free.
    for idx in 0..DIRECT_BLOCKS {
        if di.slot(idx).is_none() {
            di.set_slot(idx, new_sector);
            return true;
        }
    }

    // The indirect sector, allocated lazily.
    let mut fresh_indirect = false;
    if di.slot(INDIRECT_IDX).is_none() {
        let Some(sector) = fs.free_map.allocate() else {
            return false;
        };
        di.set_slot(INDIRECT_IDX, sector);
        fresh_indirect = true;
    }
    let i_sector = di.slot(INDIRECT_IDX).expect("indirect pointer just set");
    {
        let mut w = fs.cache.get_exclusive(i_sector, SlotKind::Data);
        let mut ib = if fresh_indirect {
            IndirectBlock::empty()
        } else {
            IndirectBlock::decode(w.bytes())
        };
        if let Some(free) = ib.first_missing() {
            ib.sectors[free] = new_sector.0;
            w.bytes_mut().copy_from_slice(ib.as_bytes());
            return true;
        }
        if fresh_indirect {
            w.bytes_mut().copy_from_slice(ib.as_bytes());
        }
    }

    // The doubly indirect tree, each level allocated lazily.
    let mut fresh_doubly = false;
    if di.slot(DOUBLY_IDX).is_none() {
        let Some(sector) = fs.free_map.allocate() else {
            return false;
        };
        di.set_slot(DOUBLY_IDX, sector);
        fresh_doubly = true;
    }
    let d_sector = di.slot(DOUBLY_IDX).expect("doubly indirect pointer just set");

    let mut w = fs.cache.get_exclusive(d_sector, SlotKind::Data);
    let mut db = if fresh_doubly {
        IndirectBlock::empty()
    } else {
        IndirectBlock::decode(w.bytes())
    };

    for idx in 0..PTRS_PER_SECTOR {
        let (child, fresh_child) = match db.slot(idx) {
            Some(child) => (child, false),
            None => {
                let Some(sector) = fs.free_map.allocate() else {
                    w.bytes_mut().copy_from_slice(db.as_bytes());
                    return false;
                };
                db.sectors[idx] = sector.0;
                (sector, true)
            }
        };

        // The doubly indirect sector stays held while its child is
        // touched; the level closer to the inode is acquired first.
        let mut cw = fs.cache.get_exclusive(child, SlotKind::Data);
        let mut cb = if fresh_child {
            IndirectBlock::empty()
        } else {
            IndirectBlock::decode(cw.bytes())
        };
        if let Some(free) = cb.first_missing() {
            cb.sectors[free] = new_sector.0;
            cw.bytes_mut().copy_from_slice(cb.as_bytes());
            drop(cw);
            w.bytes_mut().copy_from_slice(db.as_bytes());
            return true;
        }
        drop(cw);
    }

    // Out of space in the file.
    w.bytes_mut().copy_from_slice(db.as_bytes());
    false
}

pub(crate) fn write_new_inode(fs: &FileSystem, sector: Sector, length: usize, kind: InodeKind) {
    let mut di = DiskInode::new_zeroed();
    di.length = length as i32;
    di.magic = INODE_MAGIC;
    di.kind = kind as u32;
    di.sectors = [RAW_MISSING; INODE_SECTORS];
    let mut w = fs.cache.get_exclusive(sector, SlotKind::Inode);
    w.bytes_mut().copy_from_slice(di.as_bytes());
}

pub(crate) fn read_inode_kind(fs: &FileSystem, sector: Sector) -> Result<InodeKind, KernelError> {
    let g = fs.cache.get_shared(sector, SlotKind::Inode);
    let di = DiskInode::decode(g.bytes());
    if di.magic != INODE_MAGIC {
        return Err(KernelError::FilesystemCorrupted("inode magic mismatch"));
    }
    InodeKind::try_from(di.kind)
        .map_err(|_| KernelError::FilesystemCorrupted("unknown inode kind"))
}
