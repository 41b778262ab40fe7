//! # Mapping Flags
//!
//! Caller-facing permissions and options. These are deliberately decoupled
//! from the hardware entry bits in [`PageEntry`](crate::page_table::PageEntry):
//! the translation depends on what the CPU supports, see [`PagingFeatures`].

use crate::page_table::TableLevel;
use utils_accessors_derive::{Getters, Setters};

bitflags::bitflags! {
    /// Access permissions of a mapped page.
    ///
    /// The empty set is a present, read-only, non-executable supervisor page.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Keep the translation across address-space switches.
        ///
        /// Only honored when [`PagingFeatures::global_pages`] is set.
        const GLOBAL     = 1 << 0;

        /// Accessible from ring 3.
        const USERLAND   = 1 << 1;

        /// Writes are allowed.
        const WRITABLE   = 1 << 2;

        /// Instruction fetches are allowed.
        ///
        /// Without NX support every page is executable and this flag is
        /// implied on read-back.
        const EXECUTABLE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Per-call behavior switches for map and unmap operations.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapOptions: u32 {
        /// Do not touch the frame's reference count (MMIO, firmware ranges).
        const NO_REFERENCE_COUNTING = 1 << 0;

        /// Do not invalidate the TLB entry after the change.
        const NO_INVALIDATION       = 1 << 1;
    }
}

/// Paging capabilities of the CPU, detected once at boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Getters, Setters)]
pub struct PagingFeatures {
    /// `EFER.NXE` is enabled; the execute-disable bit is honored.
    nx: bool,
    /// `CR4.PGE` is enabled; the global bit is honored.
    global_pages: bool,
}

impl PagingFeatures {
    /// Feature set of every long-mode CPU this kernel targets.
    #[must_use]
    pub const fn baseline() -> Self {
        Self {
            nx: true,
            global_pages: true,
        }
    }

    /// No optional features at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            nx: false,
            global_pages: false,
        }
    }
}

impl Default for PagingFeatures {
    fn default() -> Self {
        Self::baseline()
    }
}

/// Size of a single leaf mapping, chosen at runtime.
///
/// The static counterparts are the [`PageSize`](kernel_memory_addresses::PageSize)
/// markers; this enum exists for APIs that pick the size per call.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FrameSize {
    /// 4 KiB, mapped by a PT entry.
    Size4K,
    /// 2 MiB, mapped by a PD entry with `PS=1`.
    Size2M,
    /// 1 GiB, mapped by a PDPT entry with `PS=1`.
    Size1G,
}

impl FrameSize {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 0x1000,
            Self::Size2M => 0x20_0000,
            Self::Size1G => 0x4000_0000,
        }
    }

    /// The table level holding a leaf of this size.
    #[inline]
    #[must_use]
    pub const fn leaf_level(self) -> TableLevel {
        match self {
            Self::Size4K => TableLevel::Pt,
            Self::Size2M => TableLevel::Pd,
            Self::Size1G => TableLevel::Pdpt,
        }
    }

    /// The leaf size mapped by an entry at `level`, if leaves may live there.
    #[inline]
    #[must_use]
    pub const fn from_leaf_level(level: TableLevel) -> Option<Self> {
        match level {
            TableLevel::Pt => Some(Self::Size4K),
            TableLevel::Pd => Some(Self::Size2M),
            TableLevel::Pdpt => Some(Self::Size1G),
            TableLevel::Pml4 => None,
        }
    }

    /// Returns `true` if `value` is a multiple of this size.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, value: u64) -> bool {
        value & (self.bytes() - 1) == 0
    }
}
