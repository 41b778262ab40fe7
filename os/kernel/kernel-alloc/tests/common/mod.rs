#![allow(dead_code)]

use core::ptr::NonNull;
use kernel_alloc::{AllocationOptions, FrameAllocationSpace, FrameAllocator, MemoryManager};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
use kernel_vmem::{PagingFeatures, SoftMmu};

/// Physical base of the simulated memory.
pub const BASE: u64 = 0x10_0000;

/// A frame space over `[start, start + frames * 4 KiB)` whose control area
/// lives on the host heap.
pub fn space(start: u64, frames: u64) -> FrameAllocationSpace {
    let start = PhysicalAddress::new(start);
    let end = start + frames * 0x1000;
    let bytes = FrameAllocationSpace::control_bytes(start, end, 0x1000);
    let control = Box::leak(vec![0u64; bytes.div_ceil(8)].into_boxed_slice());
    let control = NonNull::new(control.as_mut_ptr().cast::<u8>()).unwrap();
    unsafe { FrameAllocationSpace::from_raw_parts(start, end, 0x1000, control) }.unwrap()
}

/// Simulated memory plus the allocator owning it.
pub struct Machine {
    pub mmu: SoftMmu,
    pub frames: FrameAllocator,
}

/// Boots a memory manager over `frames` simulated frames.
///
/// The machine is leaked so the manager can borrow it for `'static`.
pub fn boot(frames: u64) -> MemoryManager<'static, SoftMmu> {
    let machine: &'static Machine = Box::leak(Box::new(Machine {
        mmu: SoftMmu::new(PhysicalAddress::new(BASE), frames as usize),
        frames: FrameAllocator::new(),
    }));
    machine.frames.add_space(space(BASE, frames)).unwrap();
    let root = machine.frames.allocate(AllocationOptions::General).unwrap();
    machine
        .mmu
        .bootstrap_root(PhysicalPage::from_addr(root))
        .unwrap();
    MemoryManager::bootstrap(&machine.mmu, &machine.frames, PagingFeatures::baseline()).unwrap()
}
