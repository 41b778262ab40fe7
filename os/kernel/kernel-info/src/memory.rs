//! # Memory Layout
//!
//! The fixed virtual address-space layout shared by every address space. Other
//! kernel code assumes these ranges; they are an internal ABI and must stay
//! stable.
//!
//! All zone boundaries in the higher half are 1 GiB aligned. Together with the
//! pre-allocated kernel PDPTs this guarantees that two zones never need to
//! create the same page directory or page table.

/// Size of a base page.
pub const PAGE_SIZE: u64 = 0x1000;

/// Size of a large (2 MiB) page.
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;

/// Size of the range covered by one PML4 slot.
pub const PML4_SLOT_SIZE: u64 = 1 << 39;

/// First user-space address handed out by allocations; the first 2 MiB stay
/// unmapped to catch null dereferences.
pub const USERLAND_START: u64 = LARGE_PAGE_SIZE;

/// End (exclusive) of the lower, per-process half.
pub const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Start of the shared higher half.
pub const HIGHER_HALF_START: u64 = 0xFFFF_8000_0000_0000;

/// First PML4 slot of the kernel half.
pub const KERNEL_PML4_FIRST: u16 = 256;

/// ISA DMA window at the very start of the higher half.
pub const ISA_DMA_START: u64 = HIGHER_HALF_START;

/// Length of the ISA DMA window (16 MiB).
pub const ISA_DMA_LENGTH: u64 = 0x100_0000;

/// End (exclusive) of the ISA DMA window.
pub const ISA_DMA_END: u64 = ISA_DMA_START + ISA_DMA_LENGTH;

/// Start of the kernel heap.
pub const KERNEL_HEAP_START: u64 = ISA_DMA_END;

/// End (exclusive) of the kernel heap, including the per-core arenas.
pub const KERNEL_HEAP_END: u64 = 0xFFFF_FE00_0000_0000;

/// Maximum number of cores with a private heap arena.
pub const MAX_CORES: usize = 64;

/// Size of each per-core heap arena.
pub const CORE_HEAP_ARENA_SIZE: u64 = 0x1_0000_0000;

/// Start of the per-core heap arenas, which occupy the tail of the heap.
pub const CORE_HEAP_START: u64 = KERNEL_HEAP_END - MAX_CORES as u64 * CORE_HEAP_ARENA_SIZE;

/// Region holding address-space descriptors.
pub const VAS_DESCRIPTORS_START: u64 = KERNEL_HEAP_END;

/// End (exclusive) of the address-space descriptor region.
pub const VAS_DESCRIPTORS_END: u64 = VAS_DESCRIPTORS_START + 0x20_0000_0000;

/// Region holding handle tables.
pub const HANDLE_TABLES_START: u64 = VAS_DESCRIPTORS_END;

/// End (exclusive) of the handle table region.
pub const HANDLE_TABLES_END: u64 = HANDLE_TABLES_START + 0x20_0000_0000;

/// Region holding loaded kernel modules.
pub const KERNEL_MODULES_START: u64 = HANDLE_TABLES_END;

/// End (exclusive) of the kernel module region.
pub const KERNEL_MODULES_END: u64 = ALIEN_FRACTAL_START;

/// PML4 slot through which an inactive address space is manipulated.
pub const ALIEN_FRACTAL_INDEX: u16 = 509;

/// PML4 slot holding every address space's self-reference.
pub const LOCAL_FRACTAL_INDEX: u16 = 510;

/// Base of the alien self-mapping window.
pub const ALIEN_FRACTAL_START: u64 = 0xFFFF_0000_0000_0000 | ((ALIEN_FRACTAL_INDEX as u64) << 39);

/// Base of the local self-mapping window.
pub const LOCAL_FRACTAL_START: u64 = 0xFFFF_0000_0000_0000 | ((LOCAL_FRACTAL_INDEX as u64) << 39);

/// Start of both self-mapping windows.
pub const FRACTAL_START: u64 = ALIEN_FRACTAL_START;

/// End (exclusive) of both self-mapping windows.
pub const FRACTAL_END: u64 = LOCAL_FRACTAL_START + PML4_SLOT_SIZE;

/// Kernel image, stacks and loader leftovers live in the last PML4 slot.
pub const KERNEL_BINARIES_START: u64 = FRACTAL_END;

/// Inclusive end of the kernel binaries region (the top of the address space).
pub const KERNEL_BINARIES_LAST: u64 = u64::MAX;

const fn gib_aligned(value: u64) -> bool {
    value.is_multiple_of(0x4000_0000)
}

const _: () = {
    assert!(gib_aligned(HIGHER_HALF_START));
    assert!(gib_aligned(CORE_HEAP_START));
    assert!(gib_aligned(KERNEL_HEAP_END));
    assert!(gib_aligned(VAS_DESCRIPTORS_END));
    assert!(gib_aligned(HANDLE_TABLES_END));
    assert!(gib_aligned(KERNEL_MODULES_END));
    assert!(gib_aligned(KERNEL_BINARIES_START));
    assert!(CORE_HEAP_START > KERNEL_HEAP_START);
    assert!(KERNEL_MODULES_START < KERNEL_MODULES_END);
    assert!(ALIEN_FRACTAL_START == 0xFFFF_FE80_0000_0000);
    assert!(LOCAL_FRACTAL_START == 0xFFFF_FF00_0000_0000);
    assert!(KERNEL_BINARIES_START == 0xFFFF_FF80_0000_0000);
    assert!(ALIEN_FRACTAL_INDEX + 1 == LOCAL_FRACTAL_INDEX);
};
