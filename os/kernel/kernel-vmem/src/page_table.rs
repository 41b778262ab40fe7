//! # Page Tables
//!
//! A page table is one 4 KiB frame holding 512 entries of 8 bytes. All four
//! levels share the layout; what an entry means depends on the level it is
//! read at (see [`PageEntry::is_leaf_at`]).
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Entries are stored as [`AtomicU64`] so that a walker on another core never
//! observes a torn entry. Every update is a single aligned store.

mod entry;

pub use entry::PageEntry;

use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::VirtualAddress;

/// Number of entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// A level of the 4-level hierarchy, numbered from the leaf up.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    /// Page Table; entries map 4 KiB pages.
    Pt = 1,
    /// Page Directory; entries map 2 MiB pages or point to a PT.
    Pd = 2,
    /// Page Directory Pointer Table; entries map 1 GiB pages or point to a PD.
    Pdpt = 3,
    /// Page Map Level 4; the root, entries point to a PDPT.
    Pml4 = 4,
}

impl TableLevel {
    /// All levels in walk order, root first.
    pub const TOP_DOWN: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Position counted from the leaf level (PT = 1).
    #[inline]
    #[must_use]
    pub const fn depth(self) -> u32 {
        self as u32
    }

    /// Bit position of this level's index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self.depth() - 1)
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn coverage(self) -> u64 {
        1 << self.shift()
    }

    /// The index of the entry at this level translating `va`.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::masked(va.as_u64() >> self.shift())
    }

    /// The level a non-leaf entry at this level points to.
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

/// Index of an entry inside a table; always in `0..512`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Checked constructor.
    #[inline]
    #[must_use]
    pub const fn new(index: u16) -> Option<Self> {
        if (index as usize) < ENTRIES_PER_TABLE {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Keeps the low 9 bits of `value`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn masked(value: u64) -> Self {
        Self((value & 0x1FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Every index of a table, in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES_PER_TABLE).map(|i| Self::masked(i as u64))
    }
}

/// One page-table frame of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// A table with every entry not-present.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [const { AtomicU64::new(0) }; ENTRIES_PER_TABLE],
        }
    }

    /// Reads the entry at `index`.
    #[inline]
    #[must_use]
    pub fn entry(&self, index: TableIndex) -> PageEntry {
        PageEntry::from_bits(self.entries[index.as_usize()].load(Ordering::Acquire))
    }

    /// Replaces the entry at `index` with a single store.
    #[inline]
    pub fn set_entry(&self, index: TableIndex, entry: PageEntry) {
        self.entries[index.as_usize()].store(entry.into_bits(), Ordering::Release);
    }

    /// Marks every entry not-present.
    pub fn clear(&self) {
        for e in &self.entries {
            e.store(0, Ordering::Release);
        }
    }

    /// Iterates over the present entries and their indices.
    pub fn present_entries(&self) -> impl Iterator<Item = (TableIndex, PageEntry)> + '_ {
        TableIndex::all()
            .map(|i| (i, self.entry(i)))
            .filter(|(_, e)| e.present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
