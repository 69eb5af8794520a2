use minos::fs::{FileSystem, InodeKind, MemDisk};
use minos::mm::{AddressSpace, FrameTable, PAGE_SIZE, Page, SupplementalPageTable, SwapArea, Va};
use minos::mm::{PageInfo, PageLocation};
use std::sync::Arc;
use std::time::Duration;

fn fresh_swap(sectors: u32) -> Arc<SwapArea> {
    Arc::new(SwapArea::new(Arc::new(MemDisk::new(sectors))))
}

fn occupied_slots(swap: &SwapArea) -> usize {
    (0..swap.slot_count())
        .filter(|&slot| swap.is_occupied(slot))
        .count()
}

#[test]
fn swap_round_trip() {
    let swap = fresh_swap(64);
    assert_eq!(swap.slot_count(), 8);

    let mut page = Page::new();
    for (i, b) in page.inner_mut().iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let slot = swap.write_page(&page).expect("swap has room");
    assert!(swap.is_occupied(slot));

    let mut readback = Page::new();
    swap.read_page(slot, &mut readback);
    assert_eq!(readback.inner(), page.inner());
    // The slot is given back by the read.
    assert!(!swap.is_occupied(slot));
}

#[test]
fn swap_full_reports_none() {
    let swap = fresh_swap(16); // two slots
    let page = Page::new();

    let a = swap.write_page(&page).unwrap();
    let b = swap.write_page(&page).unwrap();
    assert_ne!(a, b);
    assert!(swap.write_page(&page).is_none());

    swap.free_slot(a);
    assert!(swap.write_page(&page).is_some());
    swap.free_slot(b);
}

#[test]
fn spt_lookup_rounds_down() {
    let spt = SupplementalPageTable::new();
    spt.insert(PageInfo {
        va: Va(0x5000),
        location: PageLocation::Zero,
        file: None,
        file_offset: 0,
        page_bytes: 0,
        writable: true,
        loaded: false,
        swap_slot: None,
    });

    assert!(spt.lookup(Va(0x5abc)).is_some());
    assert!(spt.lookup(Va(0x5fff)).is_some());
    assert!(spt.lookup(Va(0x6000)).is_none());

    assert!(spt.remove(Va(0x5321)).is_some());
    assert!(spt.lookup(Va(0x5000)).is_none());
}

/// Touch one page more than the table holds. Exactly one of the earlier
/// pages loses its frame, and touching it again reloads it from swap with
/// its bytes intact.
#[test]
fn eviction_under_pressure() {
    const FRAMES: usize = 4;
    let swap = fresh_swap(256);
    let frames = Arc::new(FrameTable::new(FRAMES, swap.clone(), None));
    let asp = AddressSpace::new(frames);

    let base = 0x1000_0000;
    let pages: Vec<Va> = (0..FRAMES + 1)
        .map(|i| Va(base + i * PAGE_SIZE))
        .collect();

    for (i, &va) in pages.iter().enumerate() {
        asp.map_stack(va);
        asp.write_byte(va, (i + 1) as u8).unwrap();
    }

    let resident: Vec<bool> = pages.iter().map(|&va| asp.is_resident(va)).collect();
    assert_eq!(resident.iter().filter(|&&r| r).count(), FRAMES);

    let evicted = pages[resident.iter().position(|&r| !r).unwrap()];
    let idx = pages.iter().position(|&va| va == evicted).unwrap();
    assert_eq!(occupied_slots(&swap), 1);

    // Faulting the page back pulls it from swap with its contents.
    assert_eq!(asp.read_byte(evicted).unwrap(), (idx + 1) as u8);
    assert!(asp.is_resident(evicted));

    // Every page still carries its value, faulting in as needed.
    for (i, &va) in pages.iter().enumerate() {
        assert_eq!(asp.read_byte(va).unwrap(), (i + 1) as u8);
    }
}

#[test]
fn exit_releases_frames_and_swap_slots() {
    const FRAMES: usize = 2;
    let swap = fresh_swap(256);
    let frames = Arc::new(FrameTable::new(FRAMES, swap.clone(), None));

    {
        let asp = AddressSpace::new(frames.clone());
        for i in 0..4 {
            let va = Va(0x2000_0000 + i * PAGE_SIZE);
            asp.map_stack(va);
            asp.write_byte(va, 0xcc).unwrap();
        }
        assert!(occupied_slots(&swap) > 0);
        asp.exit();
        assert_eq!(occupied_slots(&swap), 0);
    }

    // All frames are free again: a fresh address space can fill the table
    // without touching swap.
    let asp = AddressSpace::new(frames);
    for i in 0..FRAMES {
        let va = Va(0x3000_0000 + i * PAGE_SIZE);
        asp.map_stack(va);
        asp.write_byte(va, 0xdd).unwrap();
    }
    assert_eq!(occupied_slots(&swap), 0);
}

#[test]
fn file_backed_page_loads_and_zero_fills() {
    let device = Arc::new(MemDisk::new(1024));
    let fs = Arc::new(FileSystem::format_with(device, Duration::from_secs(3600)));

    let sector = fs.free_map.allocate().unwrap();
    assert!(fs.create_inode(sector, 0, InodeKind::File));
    let file = fs.open_inode(sector).unwrap();
    let content: Vec<u8> = (0..100u8).collect();
    assert_eq!(file.write_at(&fs, &content, 0), content.len());

    let swap = fresh_swap(64);
    let frames = Arc::new(FrameTable::new(4, swap, Some(fs.clone())));
    let asp = AddressSpace::new(frames);

    let va = Va(0x4000_0000);
    asp.map_file(va, file.clone(), 0, content.len(), false);

    assert_eq!(asp.read_byte(va).unwrap(), 0);
    assert_eq!(asp.read_byte(Va(va.0 + 42)).unwrap(), 42);
    // Beyond the file-backed bytes the page is zero.
    assert_eq!(asp.read_byte(Va(va.0 + content.len())).unwrap(), 0);

    // The page is read-only.
    assert!(asp.write_byte(va, 1).is_err());

    asp.exit();
    fs.close_inode(file);
}

#[test]
fn dirty_mmap_page_writes_back_on_unmap() {
    let device = Arc::new(MemDisk::new(1024));
    let fs = Arc::new(FileSystem::format_with(device, Duration::from_secs(3600)));

    let sector = fs.free_map.allocate().unwrap();
    assert!(fs.create_inode(sector, 0, InodeKind::File));
    let file = fs.open_inode(sector).unwrap();
    assert_eq!(file.write_at(&fs, &[0u8; 512], 0), 512);

    let swap = fresh_swap(64);
    let frames = Arc::new(FrameTable::new(4, swap, Some(fs.clone())));
    let asp = AddressSpace::new(frames);

    let va = Va(0x5000_0000);
    asp.map_mmap(va, file.clone(), 0, 512);

    asp.write_byte(Va(va.0 + 3), 0x77).unwrap();
    asp.unmap(va).unwrap();

    let mut readback = [0u8; 512];
    assert_eq!(file.read_at(&fs, &mut readback, 0), 512);
    assert_eq!(readback[3], 0x77);
    assert!(readback[..3].iter().all(|&b| b == 0));

    fs.close_inode(file);
}

/// Pages round-trip through eviction even when the working set mixes
/// anonymous and file-backed pages.
#[test]
fn mixed_pressure_round_trip() {
    let device = Arc::new(MemDisk::new(1024));
    let fs = Arc::new(FileSystem::format_with(device, Duration::from_secs(3600)));

    let sector = fs.free_map.allocate().unwrap();
    assert!(fs.create_inode(sector, 0, InodeKind::File));
    let file = fs.open_inode(sector).unwrap();
    let content = vec![0x11u8; PAGE_SIZE];
    assert_eq!(file.write_at(&fs, &content, 0), content.len());

    let swap = fresh_swap(512);
    let frames = Arc::new(FrameTable::new(2, swap, Some(fs.clone())));
    let asp = AddressSpace::new(frames);

    let file_va = Va(0x6000_0000);
    asp.map_file(file_va, file.clone(), 0, PAGE_SIZE, false);
    let stack_vas: Vec<Va> = (1..4).map(|i| Va(0x6000_0000 + i * PAGE_SIZE)).collect();
    for (i, &va) in stack_vas.iter().enumerate() {
        asp.map_stack(va);
        asp.write_byte(va, (0x20 + i) as u8).unwrap();
    }

    // The file page faults in even under pressure, and the stack pages
    // keep their bytes through swap.
    assert_eq!(asp.read_byte(file_va).unwrap(), 0x11);
    for (i, &va) in stack_vas.iter().enumerate() {
        assert_eq!(asp.read_byte(va).unwrap(), (0x20 + i) as u8);
    }

    asp.exit();
    fs.close_inode(file);
}
