mod common;

use common::{BASE, boot, space};
use kernel_alloc::{
    AllocationOptions, FrameAllocator, FrameStatus, IntegrityViolation, MapOptions, MemoryError,
    MemoryFlags, ZoneId,
};
use kernel_info::memory::{
    HANDLE_TABLES_START, KERNEL_MODULES_START, USERLAND_START, VAS_DESCRIPTORS_START,
};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::TableLevel;
use std::collections::HashSet;

const PAGE: u64 = 0x1000;

#[test]
fn small_space_hands_out_every_allocable_frame_once() {
    let frames = FrameAllocator::new();
    frames.add_space(space(BASE, 1024)).unwrap();
    let stats = frames.stats();
    assert_eq!(stats.allocable, 1016);
    assert_eq!(stats.control, 8);

    let mut seen = HashSet::new();
    for _ in 0..1016 {
        let pa = frames.allocate(AllocationOptions::General).unwrap();
        assert!(seen.insert(pa), "{pa} handed out twice");
    }
    assert_eq!(
        frames.allocate(AllocationOptions::General),
        Err(MemoryError::OutOfMemory)
    );

    let some = *seen.iter().next().unwrap();
    frames.free(some).unwrap();
    assert_eq!(frames.stats().free, 1);
    assert_eq!(frames.allocate(AllocationOptions::General), Ok(some));
}

#[test]
fn map_then_query_reports_frame_and_flags() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let pa = mm.frames().allocate(AllocationOptions::General).unwrap();
    let va = VirtualAddress::new(VAS_DESCRIPTORS_START + 0x5000);

    mm.map_page(kernel, va, pa, MemoryFlags::WRITABLE, MapOptions::empty())
        .unwrap();
    assert_eq!(mm.try_translate(kernel, va + 0x42).unwrap(), Some(pa + 0x42));
    assert_eq!(mm.page_flags(kernel, va).unwrap(), MemoryFlags::WRITABLE);
    assert_eq!(mm.frames().reference_count(pa), Some(1));

    assert_eq!(
        mm.map_page(kernel, va, pa, MemoryFlags::WRITABLE, MapOptions::empty()),
        Err(MemoryError::PageMapped)
    );

    assert_eq!(mm.unmap_page(kernel, va, MapOptions::empty()), Ok(pa));
    assert_eq!(mm.try_translate(kernel, va).unwrap(), None);
    assert_eq!(mm.page_flags(kernel, va), Err(MemoryError::PageNotMapped));
    // The last reference went with the mapping.
    assert_eq!(mm.frames().status(pa), Some(FrameStatus::Free));
}

#[test]
fn shared_frames_stay_until_the_last_mapping_goes() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let pa = mm.frames().allocate(AllocationOptions::General).unwrap();
    let first = VirtualAddress::new(HANDLE_TABLES_START);
    let second = VirtualAddress::new(KERNEL_MODULES_START);

    mm.map_page(kernel, first, pa, MemoryFlags::empty(), MapOptions::empty())
        .unwrap();
    mm.map_page(kernel, second, pa, MemoryFlags::empty(), MapOptions::empty())
        .unwrap();
    assert_eq!(mm.frames().reference_count(pa), Some(2));

    mm.unmap_page(kernel, first, MapOptions::empty()).unwrap();
    assert_eq!(mm.frames().status(pa), Some(FrameStatus::InUse));
    mm.unmap_page(kernel, second, MapOptions::empty()).unwrap();
    assert_eq!(mm.frames().status(pa), Some(FrameStatus::Free));
}

#[test]
fn set_page_flags_adds_execute_permission() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let va = VirtualAddress::new(0x1000_0000);
    let pa = PhysicalAddress::new(0x2000);

    mm.map_page(kernel, va, pa, MemoryFlags::WRITABLE, MapOptions::empty())
        .unwrap();
    let shootdowns = mm.mmu().shootdowns();
    mm.set_page_flags(kernel, va, MemoryFlags::WRITABLE | MemoryFlags::EXECUTABLE)
        .unwrap();
    assert_eq!(
        mm.page_flags(kernel, va).unwrap(),
        MemoryFlags::WRITABLE | MemoryFlags::EXECUTABLE
    );
    assert_eq!(mm.try_translate(kernel, va).unwrap(), Some(pa));
    assert_eq!(mm.mmu().shootdowns(), shootdowns + 1);

    // Frames outside every space are not counted, so unmapping is quiet.
    assert_eq!(mm.unmap_page(kernel, va, MapOptions::empty()), Ok(pa));
}

#[test]
fn reservation_respects_only_free() {
    let frames = FrameAllocator::new();
    frames.add_space(space(BASE, 64)).unwrap();
    let used = frames.allocate(AllocationOptions::General).unwrap();
    let before = frames.stats();

    assert_eq!(
        frames.reserve_byte_range(used, PAGE, true),
        Err(MemoryError::PageMapped)
    );
    assert_eq!(frames.stats(), before);

    frames.reserve_byte_range(used, PAGE, false).unwrap();
    let after = frames.stats();
    assert_eq!(frames.status(used), Some(FrameStatus::Reserved));
    assert_eq!(after.free, before.free);
    assert_eq!(after.in_use, before.in_use - 1);
    assert_eq!(after.reserved, before.reserved + 1);

    // Reserved frames never come back from the allocator.
    while let Ok(pa) = frames.allocate(AllocationOptions::General) {
        assert_ne!(pa, used);
    }
}

#[test]
fn rejects_unaligned_and_reserved_addresses() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let pa = PhysicalAddress::new(0x3000);

    assert_eq!(
        mm.map_page(kernel, VirtualAddress::new(0x1000_0010), pa, MemoryFlags::empty(), MapOptions::empty()),
        Err(MemoryError::AlignmentFailure)
    );
    assert_eq!(
        mm.map_page(kernel, VirtualAddress::new(0x1000_0000), pa + 8, MemoryFlags::empty(), MapOptions::empty()),
        Err(MemoryError::AlignmentFailure)
    );
    assert_eq!(
        mm.map_page(kernel, VirtualAddress::new(0xFFFF_FF00_0000_0000), pa, MemoryFlags::empty(), MapOptions::empty()),
        Err(MemoryError::ArgumentOutOfRange)
    );
    assert_eq!(
        mm.map_page(kernel, VirtualAddress::new(0x0000_9000_0000_0000), pa, MemoryFlags::empty(), MapOptions::empty()),
        Err(MemoryError::ArgumentOutOfRange)
    );
}

#[test]
fn counted_mappings_need_an_allocated_frame() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let pa = mm.frames().allocate(AllocationOptions::General).unwrap();
    mm.frames().free(pa).unwrap();
    let va = VirtualAddress::new(HANDLE_TABLES_START);

    assert_eq!(
        mm.map_page(kernel, va, pa, MemoryFlags::empty(), MapOptions::empty()),
        Err(MemoryError::ArgumentOutOfRange)
    );
    assert_eq!(mm.try_translate(kernel, va).unwrap(), None);
    assert_eq!(mm.frames().reference_count(pa), Some(0));

    // Uncounted mappings leave the frame alone.
    mm.map_page(kernel, va, pa, MemoryFlags::empty(), MapOptions::NO_REFERENCE_COUNTING)
        .unwrap();
    assert_eq!(mm.frames().status(pa), Some(FrameStatus::Free));
    assert_eq!(mm.unmap_page(kernel, va, MapOptions::NO_REFERENCE_COUNTING), Ok(pa));
}

#[test]
fn allocated_pages_are_mapped_and_freed() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();

    let va = mm
        .allocate_pages(kernel, 8, ZoneId::CoreHeap(2), MemoryFlags::WRITABLE)
        .unwrap();
    let in_use = mm.frames().stats().in_use;
    let mut frames = vec![];
    for i in 0..8 {
        let pa = mm.try_translate(kernel, va + i * PAGE).unwrap().unwrap();
        assert_eq!(mm.frames().reference_count(pa), Some(1));
        frames.push(pa);
    }

    let next = mm
        .allocate_pages(kernel, 1, ZoneId::CoreHeap(2), MemoryFlags::WRITABLE)
        .unwrap();
    assert_eq!(next, va + 8 * PAGE);

    mm.free_pages(kernel, va, 8).unwrap();
    for (i, pa) in frames.into_iter().enumerate() {
        assert_eq!(mm.try_translate(kernel, va + i as u64 * PAGE).unwrap(), None);
        assert_eq!(mm.frames().status(pa), Some(FrameStatus::Free));
    }
    // The ninth page is still allocated.
    assert_eq!(mm.frames().stats().in_use, in_use + 1 - 8);
}

#[test]
fn large_allocations_count_every_frame_once() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let before = mm.frames().stats();

    let va = mm
        .allocate_pages(kernel, 40, ZoneId::KernelBinaries, MemoryFlags::WRITABLE)
        .unwrap();
    let mut frames = HashSet::new();
    for i in 0..40 {
        let pa = mm.try_translate(kernel, va + i * PAGE).unwrap().unwrap();
        assert_eq!(mm.frames().reference_count(pa), Some(1));
        assert!(frames.insert(pa));
    }

    mm.free_pages(kernel, va, 40).unwrap();
    assert!(frames.iter().all(|&pa| mm.frames().status(pa) == Some(FrameStatus::Free)));
    let after = mm.frames().stats();
    // Page tables created on the way are kept.
    let tables = before.free - after.free;
    assert!((1..=2).contains(&tables), "{tables} tables");
    assert_eq!(after.in_use, before.in_use + tables);
}

#[test]
fn failed_allocation_leaves_nothing_mapped() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let start = VirtualAddress::new(HANDLE_TABLES_START);
    let blocker = start + 2 * PAGE;

    mm.map_page(
        kernel,
        blocker,
        PhysicalAddress::new(0x7000),
        MemoryFlags::empty(),
        MapOptions::NO_REFERENCE_COUNTING,
    )
    .unwrap();
    let before = mm.frames().stats();

    assert_eq!(
        mm.allocate_pages(kernel, 4, ZoneId::HandleTables, MemoryFlags::WRITABLE),
        Err(MemoryError::PageMapped)
    );
    assert_eq!(mm.try_translate(kernel, start).unwrap(), None);
    assert_eq!(mm.try_translate(kernel, start + PAGE).unwrap(), None);
    assert!(mm.try_translate(kernel, blocker).unwrap().is_some());
    assert_eq!(mm.try_translate(kernel, start + 3 * PAGE).unwrap(), None);
    assert_eq!(mm.frames().stats(), before);
}

#[test]
fn allocation_stops_at_out_of_memory_and_rolls_back() {
    let mm = boot(512);
    let kernel = mm.kernel_space();
    let before = mm.frames().stats();
    let free = before.free;

    assert_eq!(
        mm.allocate_pages(kernel, free + 1, ZoneId::KernelModules, MemoryFlags::WRITABLE),
        Err(MemoryError::OutOfMemory)
    );
    let start = VirtualAddress::new(KERNEL_MODULES_START);
    assert_eq!(mm.try_translate(kernel, start).unwrap(), None);
    // Only the new page directory and page table stay behind.
    let after = mm.frames().stats();
    assert_eq!(after.free, free - 2);
    assert_eq!(after.in_use, before.in_use + 2);
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "unmapping unmapped page"))]
fn freeing_partly_unmapped_range_changes_nothing() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let va = mm
        .allocate_pages(kernel, 1, ZoneId::VasDescriptors, MemoryFlags::WRITABLE)
        .unwrap();

    let result = mm.free_pages(kernel, va, 2);
    assert_eq!(
        result,
        Err(MemoryError::IntegrityFailure(IntegrityViolation::UnmapUnmapped(va + PAGE)))
    );
    assert!(mm.try_translate(kernel, va).unwrap().is_some());
}

#[test]
fn failed_release_still_frees_the_whole_range() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let va = VirtualAddress::new(KERNEL_MODULES_START);
    let frames: Vec<_> = (0..3)
        .map(|_| mm.frames().allocate(AllocationOptions::General).unwrap())
        .collect();
    for (i, &pa) in frames.iter().enumerate() {
        let options = if i == 1 {
            MapOptions::NO_REFERENCE_COUNTING
        } else {
            MapOptions::empty()
        };
        mm.map_page(kernel, va + i as u64 * PAGE, pa, MemoryFlags::WRITABLE, options)
            .unwrap();
    }

    // Debug builds halt on the underflow; release builds report it at the end.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        mm.free_pages(kernel, va, 3)
    }));
    match result {
        Ok(r) => {
            assert_eq!(
                r,
                Err(MemoryError::IntegrityFailure(
                    IntegrityViolation::ReferenceUnderflow(frames[1])
                ))
            );
            assert_eq!(mm.frames().status(frames[2]), Some(FrameStatus::Free));
        }
        Err(_) => assert!(cfg!(debug_assertions)),
    }

    for i in 0..3 {
        assert_eq!(mm.try_translate(kernel, va + i * PAGE).unwrap(), None);
    }
    assert_eq!(mm.frames().status(frames[0]), Some(FrameStatus::Free));
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "double free"))]
fn double_free_is_an_integrity_failure() {
    let frames = FrameAllocator::new();
    frames.add_space(space(BASE, 64)).unwrap();
    let pa = frames.allocate(AllocationOptions::General).unwrap();
    frames.free(pa).unwrap();
    assert_eq!(
        frames.free(pa),
        Err(MemoryError::IntegrityFailure(IntegrityViolation::DoubleFree(pa)))
    );
}

#[test]
fn ranges_use_large_pages_where_possible() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let va = VirtualAddress::new(KERNEL_MODULES_START);
    let pa = PhysicalAddress::new(0x4000_0000);
    let len = 2 * 0x20_0000 + 3 * PAGE;

    mm.map_range(kernel, va, pa, len, MemoryFlags::WRITABLE).unwrap();
    assert_eq!(
        mm.try_translate(kernel, va + 0x30_1234).unwrap(),
        Some(pa + 0x30_1234)
    );
    assert_eq!(
        mm.try_translate(kernel, va + 0x40_2000).unwrap(),
        Some(pa + 0x40_2000)
    );
    assert_eq!(mm.try_translate(kernel, va + 0x40_3000).unwrap(), None);

    let mut dump = String::new();
    let present = mm
        .dump_level(kernel, va, TableLevel::Pd, &mut dump)
        .unwrap();
    // Two large pages and one page table.
    assert_eq!(present, Some(3));
    assert_eq!(dump.matches(" page ").count(), 2);

    // Half a large page cannot be removed.
    assert_eq!(
        mm.unmap_range(kernel, va + PAGE, PAGE),
        Err(MemoryError::AlignmentFailure)
    );
    mm.unmap_range(kernel, va, len).unwrap();
    assert_eq!(mm.try_translate(kernel, va).unwrap(), None);
    assert_eq!(mm.try_translate(kernel, va + 0x40_0000).unwrap(), None);
}

#[test]
fn overlapping_range_is_rolled_back() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let va = VirtualAddress::new(KERNEL_MODULES_START);
    mm.map_page(
        kernel,
        va + 0x20_1000,
        PhysicalAddress::new(0x9000),
        MemoryFlags::empty(),
        MapOptions::NO_REFERENCE_COUNTING,
    )
    .unwrap();
    let shootdowns = mm.mmu().shootdowns();

    assert_eq!(
        mm.map_range(kernel, va, PhysicalAddress::new(0x4000_0000), 0x40_0000, MemoryFlags::empty()),
        Err(MemoryError::PageMapped)
    );
    // The large page mapped before the collision is gone on every core.
    assert_eq!(mm.mmu().shootdowns(), shootdowns + 1);
    assert_eq!(mm.try_translate(kernel, va).unwrap(), None);
    assert_eq!(
        mm.try_translate(kernel, va + 0x20_1000).unwrap(),
        Some(PhysicalAddress::new(0x9000))
    );
}

#[test]
fn process_space_is_edited_while_inactive() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let user = mm.create_process_space().unwrap();
    assert!(!mm.is_active(&user));

    let flags = MemoryFlags::WRITABLE | MemoryFlags::USERLAND;
    let va = mm.allocate_pages(&user, 2, ZoneId::User, flags).unwrap();
    assert_eq!(va.as_u64(), USERLAND_START);
    let pa = mm.try_translate(&user, va).unwrap().unwrap();
    assert_eq!(mm.try_translate(kernel, va).unwrap(), None);
    assert_eq!(mm.mmu().translate_in(user.root(), va), Some(pa));

    let mut sink = String::new();
    assert_eq!(
        mm.dump_level(&user, va, TableLevel::Pt, &mut sink),
        Err(MemoryError::UnsupportedOperation)
    );

    let kva = mm
        .allocate_pages(kernel, 1, ZoneId::KernelHeap, MemoryFlags::WRITABLE)
        .unwrap();
    let kpa = mm.try_translate(kernel, kva).unwrap().unwrap();

    unsafe { mm.activate(&user) };
    assert!(mm.is_active(&user));
    assert_eq!(mm.mmu().translate(va), Some(pa));
    assert_eq!(mm.mmu().translate(kva), Some(kpa));
    assert_eq!(
        mm.dump_level(&user, va, TableLevel::Pt, &mut sink).unwrap(),
        Some(2)
    );
    assert!(sink.starts_with("PT containing"));

    // The kernel space is now the inactive one.
    let low = VirtualAddress::new(0x4000_0000);
    mm.map_page(kernel, low, PhysicalAddress::new(0x8000), MemoryFlags::empty(), MapOptions::empty())
        .unwrap();
    assert_eq!(mm.mmu().translate(low), None);
    assert_eq!(
        mm.try_translate(kernel, low).unwrap(),
        Some(PhysicalAddress::new(0x8000))
    );

    unsafe { mm.activate(kernel) };
    mm.free_pages(&user, va, 2).unwrap();
    assert_eq!(mm.frames().status(pa), Some(FrameStatus::Free));
}
