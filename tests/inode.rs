use minos::fs::{FileSystem, Inode, InodeKind, MemDisk, SECTOR_SIZE, Sector};
use std::sync::Arc;
use std::time::Duration;

const DISK_SECTORS: u32 = 4096;

fn fresh_fs(sectors: u32) -> (Arc<MemDisk>, FileSystem) {
    let device = Arc::new(MemDisk::new(sectors));
    let fs = FileSystem::format_with(device.clone(), Duration::from_secs(3600));
    (device, fs)
}

fn create_file(fs: &FileSystem) -> Arc<Inode> {
    let sector = fs.free_map.allocate().expect("disk full");
    assert!(fs.create_inode(sector, 0, InodeKind::File));
    fs.open_inode(sector).expect("fresh inode must open")
}

fn allocated_sectors(fs: &FileSystem, total: u32) -> usize {
    (0..total)
        .filter(|&s| fs.free_map.is_allocated(Sector(s)))
        .count()
}

#[test]
fn grow_by_one_sector() {
    let (_device, fs) = fresh_fs(DISK_SECTORS);
    let inode = create_file(&fs);

    assert_eq!(inode.write_at(&fs, b"hello", 0), 5);
    assert_eq!(inode.length(&fs), 5);

    assert_eq!(inode.write_at(&fs, b"world", 512), 5);
    assert_eq!(inode.length(&fs), 517);

    // The gap reads back as zeros.
    let mut gap = vec![0xffu8; 507];
    assert_eq!(inode.read_at(&fs, &mut gap, 5), 507);
    assert!(gap.iter().all(|&b| b == 0));

    let mut head = [0u8; 5];
    assert_eq!(inode.read_at(&fs, &mut head, 0), 5);
    assert_eq!(&head, b"hello");
    let mut tail = [0u8; 5];
    assert_eq!(inode.read_at(&fs, &mut tail, 512), 5);
    assert_eq!(&tail, b"world");

    fs.close_inode(inode);
}

#[test]
fn doubly_indirect_reach() {
    // 123 direct + 128 indirect entries = 251 sectors; one byte more
    // needs the doubly indirect path.
    const BOUNDARY_SECTORS: usize = 251;

    let (_device, fs) = fresh_fs(DISK_SECTORS);
    let inode = create_file(&fs);

    let mut body = vec![0u8; BOUNDARY_SECTORS * SECTOR_SIZE];
    for (i, b) in body.iter_mut().enumerate() {
        *b = (i / SECTOR_SIZE) as u8;
    }
    assert_eq!(inode.write_at(&fs, &body, 0), body.len());
    assert_eq!(inode.length(&fs), body.len());

    let before = allocated_sectors(&fs, DISK_SECTORS);

    // One write past the boundary allocates exactly the doubly indirect
    // sector, one indirect sector under it, and the data sector.
    let chunk = b"beyond the boundary";
    assert_eq!(
        inode.write_at(&fs, chunk, BOUNDARY_SECTORS * SECTOR_SIZE),
        chunk.len()
    );
    let after = allocated_sectors(&fs, DISK_SECTORS);
    assert_eq!(after - before, 3);
    assert_eq!(inode.length(&fs), BOUNDARY_SECTORS * SECTOR_SIZE + chunk.len());

    let mut readback = vec![0u8; chunk.len()];
    assert_eq!(
        inode.read_at(&fs, &mut readback, BOUNDARY_SECTORS * SECTOR_SIZE),
        chunk.len()
    );
    assert_eq!(&readback, chunk);

    // Earlier sectors are still intact through the direct and indirect
    // paths.
    let mut sector0 = vec![0u8; SECTOR_SIZE];
    assert_eq!(inode.read_at(&fs, &mut sector0, 0), SECTOR_SIZE);
    assert!(sector0.iter().all(|&b| b == 0));
    let mut sector200 = vec![0u8; SECTOR_SIZE];
    assert_eq!(inode.read_at(&fs, &mut sector200, 200 * SECTOR_SIZE), SECTOR_SIZE);
    assert!(sector200.iter().all(|&b| b == 200));

    fs.close_inode(inode);
}

#[test]
fn sparse_write_fills_gap_with_zeros() {
    let (_device, fs) = fresh_fs(DISK_SECTORS);
    let inode = create_file(&fs);

    assert_eq!(inode.write_at(&fs, b"AA", 0), 2);
    assert_eq!(inode.write_at(&fs, b"BB", 3000), 2);
    assert_eq!(inode.length(&fs), 3002);

    let mut gap = vec![0x55u8; 2998];
    assert_eq!(inode.read_at(&fs, &mut gap, 2), 2998);
    assert!(gap.iter().all(|&b| b == 0), "gap bytes must read as zero");

    fs.close_inode(inode);
}

#[test]
fn removed_inode_releases_every_sector() {
    let (_device, fs) = fresh_fs(DISK_SECTORS);
    let baseline = allocated_sectors(&fs, DISK_SECTORS);

    let inode = create_file(&fs);
    // Enough to reach through the indirect block.
    let body = vec![0xabu8; 130 * SECTOR_SIZE];
    assert_eq!(inode.write_at(&fs, &body, 0), body.len());
    assert!(allocated_sectors(&fs, DISK_SECTORS) > baseline + 130);

    inode.remove();
    fs.close_inode(inode);

    assert_eq!(allocated_sectors(&fs, DISK_SECTORS), baseline);
}

#[test]
fn reopen_returns_the_same_inode() {
    let (_device, fs) = fresh_fs(DISK_SECTORS);
    let inode = create_file(&fs);
    let sector = inode.sector();
    assert_eq!(inode.open_count(), 1);

    let again = fs.open_inode(sector).unwrap();
    assert!(Arc::ptr_eq(&inode, &again));
    assert_eq!(inode.open_count(), 2);

    fs.close_inode(again);
    assert_eq!(inode.open_count(), 1);

    fs.close_inode(inode);
}

#[test]
fn deny_write_blocks_writers() {
    let (_device, fs) = fresh_fs(DISK_SECTORS);
    let inode = create_file(&fs);

    assert_eq!(inode.write_at(&fs, b"first", 0), 5);

    inode.deny_write();
    assert_eq!(inode.write_at(&fs, b"nope", 0), 0);

    inode.allow_write();
    assert_eq!(inode.write_at(&fs, b"again", 0), 5);

    fs.close_inode(inode);
}

#[test]
fn read_past_eof_returns_bytes_so_far() {
    let (_device, fs) = fresh_fs(DISK_SECTORS);
    let inode = create_file(&fs);

    assert_eq!(inode.write_at(&fs, b"0123456789", 0), 10);

    let mut buf = [0u8; 32];
    assert_eq!(inode.read_at(&fs, &mut buf, 0), 10);
    assert_eq!(&buf[..10], b"0123456789");

    assert_eq!(inode.read_at(&fs, &mut buf, 10), 0);
    assert_eq!(inode.read_at(&fs, &mut buf, 4), 6);
    assert_eq!(&buf[..6], b"456789");

    fs.close_inode(inode);
}

#[test]
fn survives_unmount_and_mount() {
    let device = Arc::new(MemDisk::new(DISK_SECTORS));
    let file_sector;
    {
        let fs = FileSystem::format_with(device.clone(), Duration::from_secs(3600));
        let inode = create_file(&fs);
        file_sector = inode.sector();
        assert_eq!(inode.write_at(&fs, b"persistent data", 0), 15);
        fs.close_inode(inode);
        // Dropping the filesystem persists the free-map and flushes the
        // cache.
    }

    let fs = FileSystem::mount_with(device, Duration::from_secs(3600)).expect("mount");
    assert!(fs.free_map.is_allocated(file_sector));

    let inode = fs.open_inode(file_sector).expect("reopen after mount");
    assert_eq!(inode.kind(), InodeKind::File);
    let mut buf = [0u8; 15];
    assert_eq!(inode.read_at(&fs, &mut buf, 0), 15);
    assert_eq!(&buf, b"persistent data");
    fs.close_inode(inode);
}

#[test]
fn write_returns_bytes_written_when_disk_fills() {
    // A deliberately tiny disk: the write must stop early, not panic.
    let (_device, fs) = fresh_fs(64);
    let inode = create_file(&fs);

    let body = vec![0x5au8; 100 * SECTOR_SIZE];
    let written = inode.write_at(&fs, &body, 0);
    assert!(written < body.len());
    assert_eq!(inode.length(&fs), written);

    let mut readback = vec![0u8; written];
    assert_eq!(inode.read_at(&fs, &mut readback, 0), written);
    assert!(readback.iter().all(|&b| b == 0x5a));

    fs.close_inode(inode);
}
