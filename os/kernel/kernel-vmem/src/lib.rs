//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's memory core.
//!
//! ## What you get
//! - [`PageTable`]/[`PageEntry`]: the hardware layout, with atomic entries.
//! - [`SelfMapWindow`]: address arithmetic of the self-mapping windows that make
//!   every table frame reachable as ordinary memory, without an identity map.
//! - [`AddressSpace`] and [`PageMapper`]: one hierarchy and the per-page
//!   operations on it (map, unmap, flags, translate, dump).
//! - [`Mmu`]: the hardware seam, with [`X86Mmu`] for bare metal and a
//!   simulated `SoftMmu` behind the `soft-mmu` feature.
//! - [`MemoryError`]: the error type shared by the whole memory core.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │       │
//!   │        │        │       └───► PTE   → maps 4 KiB page
//!   │        │        └───────────► PDE   → PS=1 → 2 MiB page
//!   │        └────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └─────────────────────────────► PML4E
//! ```
//!
//! ## Self-Mapping
//!
//! PML4 slot 510 of every root points back at the root. Walking through it
//! once treats the root as a PDPT, twice as a PD, and so on, so that the
//! tables of each level appear at fixed addresses inside
//! `0xFFFF_FF00_0000_0000..0xFFFF_FF80_0000_0000`. Slot 509 works the same way
//! for an inactive ("alien") hierarchy. See [`walker`] for the arithmetic.
//!
//! ## Locking
//!
//! Nothing in this crate takes a lock. Callers serialize mutation of a given
//! table path; the memory manager in `kernel-alloc` does so per zone.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space;
pub mod error;
pub mod flags;
pub mod mmu;
pub mod page_table;
pub mod walker;

pub use crate::address_space::{AddressSpace, MappedEntry, NewTables, PageMapper, TableDump, Unmapped};
pub use crate::error::{IntegrityViolation, MemoryError, MemoryResult};
pub use crate::flags::{FrameSize, MapOptions, MemoryFlags, PagingFeatures};
#[cfg(any(test, feature = "soft-mmu"))]
pub use crate::mmu::SoftMmu;
pub use crate::mmu::Mmu;
#[cfg(target_arch = "x86_64")]
pub use crate::mmu::X86Mmu;
pub use crate::page_table::{PageEntry, PageTable, TableIndex, TableLevel};
pub use crate::walker::{SelfMapWindow, WindowTables};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Source of physical frames for page tables.
///
/// Returned frames must be 4 KiB aligned and owned by the caller until they
/// are installed in a table. Zeroing is not required; the mapper clears new
/// tables through the window.
pub trait FrameAlloc {
    /// Allocates one 4 KiB frame for a page table.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if no frame is left.
    fn allocate_table_frame(&self) -> MemoryResult<PhysicalPage<Size4K>>;
}
