use crate::flags::{MemoryFlags, PagingFeatures};
use crate::page_table::TableLevel;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// This models the common superset of the four levels (PML4E, PDPTE, PDE,
/// PTE). Whether an entry is a leaf depends on where it is read, see
/// [`PageEntry::is_leaf_at`].
///
/// | Bits   | Name  | Meaning |
/// |--------|-------|---------|
/// | 0      | P     | Present |
/// | 1      | RW    | Writable |
/// | 2      | US    | User accessible |
/// | 3      | PWT   | Write-through |
/// | 4      | PCD   | Cache disable |
/// | 5      | A     | Accessed |
/// | 6      | D     | Dirty (leaf only) |
/// | 7      | PS    | Large page (PDE/PDPTE); PAT in a PTE |
/// | 8      | G     | Global (leaf only) |
/// | 9–11   |       | OS available |
/// | 12–51  |       | Frame bits \[51:12\] |
/// | 52–58  |       | OS available |
/// | 59–62  | PKU   | Protection key |
/// | 63     | XD    | Execute disable |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Permissions intersect over the walk, so
    /// every table above a user page carries this bit as well.
    pub userland: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disable: bool,

    /// Accessed (A, bit 5), set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), set by the CPU on the first write to a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Marks a 2 MiB PDE or 1 GiB PDPTE leaf.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical frame bits \[51:12\].
    #[bits(40)]
    frame_bits: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection key (bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// Execute Disable (XD, bit 63). Reserved unless `EFER.NXE` is set.
    pub no_execute: bool,
}

impl PageEntry {
    /// The raw address field.
    ///
    /// For a large leaf the low bits are the PAT bit and reserved zeros; use
    /// [`PageEntry::leaf_address`] there.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    /// The mapped frame base of a leaf at `level`.
    #[inline]
    #[must_use]
    pub const fn leaf_address(self, level: TableLevel) -> PhysicalAddress {
        PhysicalAddress::new(self.address().as_u64() & !(level.coverage() - 1))
    }

    #[inline]
    #[must_use]
    pub const fn with_address(self, address: PhysicalAddress) -> Self {
        self.with_frame_bits(address.as_u64() >> 12)
    }

    /// Returns `true` if this entry, read at `level`, maps memory directly.
    #[inline]
    #[must_use]
    pub const fn is_leaf_at(self, level: TableLevel) -> bool {
        match level {
            TableLevel::Pt => true,
            TableLevel::Pd | TableLevel::Pdpt => self.large_page(),
            TableLevel::Pml4 => false,
        }
    }

    /// A non-leaf entry referencing the table in `frame`.
    ///
    /// Intermediate entries are always writable; the leaf decides.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalPage<Size4K>, userland: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_userland(userland)
            .with_address(frame.base())
    }

    /// A leaf entry mapping `address` at `level` with `flags`.
    #[must_use]
    pub fn leaf(
        address: PhysicalAddress,
        level: TableLevel,
        flags: MemoryFlags,
        features: PagingFeatures,
    ) -> Self {
        Self::new()
            .with_present(true)
            .with_large_page(!matches!(level, TableLevel::Pt))
            .with_address(address)
            .with_memory_flags(flags, features)
    }

    /// Rewrites the permission bits, keeping address, size and cache bits.
    #[must_use]
    pub fn with_memory_flags(self, flags: MemoryFlags, features: PagingFeatures) -> Self {
        self.with_writable(flags.contains(MemoryFlags::WRITABLE))
            .with_userland(flags.contains(MemoryFlags::USERLAND))
            .with_global(features.global_pages() && flags.contains(MemoryFlags::GLOBAL))
            .with_no_execute(features.nx() && !flags.contains(MemoryFlags::EXECUTABLE))
    }

    /// The permissions this entry grants.
    #[must_use]
    pub fn memory_flags(self, features: PagingFeatures) -> MemoryFlags {
        let mut flags = MemoryFlags::empty();
        flags.set(MemoryFlags::WRITABLE, self.writable());
        flags.set(MemoryFlags::USERLAND, self.userland());
        flags.set(MemoryFlags::GLOBAL, self.global());
        flags.set(
            MemoryFlags::EXECUTABLE,
            !(self.no_execute() && features.nx()),
        );
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entry_is_writable_and_not_leaf() {
        let frame = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x7000));
        let e = PageEntry::table(frame, true);
        assert!(e.present() && e.writable() && e.userland());
        assert_eq!(e.address().as_u64(), 0x7000);
        assert!(!e.is_leaf_at(TableLevel::Pd));
        assert!(!e.is_leaf_at(TableLevel::Pml4));
    }

    #[test]
    fn leaf_flags_round_trip() {
        let features = PagingFeatures::baseline();
        let flags = MemoryFlags::WRITABLE | MemoryFlags::GLOBAL;
        let e = PageEntry::leaf(PhysicalAddress::new(0x2000), TableLevel::Pt, flags, features);
        assert!(e.no_execute());
        assert!(!e.large_page());
        assert_eq!(e.memory_flags(features), flags);
    }

    #[test]
    fn large_leaf_masks_pat_bit() {
        let features = PagingFeatures::baseline();
        let e = PageEntry::leaf(
            PhysicalAddress::new(0x40_0000),
            TableLevel::Pd,
            MemoryFlags::empty(),
            features,
        )
        .with_address(PhysicalAddress::new(0x40_1000));
        assert!(e.is_leaf_at(TableLevel::Pd));
        assert_eq!(e.leaf_address(TableLevel::Pd).as_u64(), 0x40_0000);
    }

    #[test]
    fn without_nx_every_page_is_executable() {
        let features = PagingFeatures::none();
        let e = PageEntry::leaf(
            PhysicalAddress::new(0x3000),
            TableLevel::Pt,
            MemoryFlags::GLOBAL,
            features,
        );
        assert!(!e.no_execute());
        assert!(!e.global());
        assert_eq!(e.memory_flags(features), MemoryFlags::EXECUTABLE);
    }

    #[test]
    fn rewriting_flags_keeps_address_and_size() {
        let features = PagingFeatures::baseline();
        let e = PageEntry::leaf(
            PhysicalAddress::new(0x20_0000),
            TableLevel::Pd,
            MemoryFlags::WRITABLE,
            features,
        )
        .with_cache_disable(true);
        let e2 = e.with_memory_flags(MemoryFlags::EXECUTABLE, features);
        assert_eq!(e2.address(), e.address());
        assert!(e2.large_page() && e2.cache_disable());
        assert_eq!(e2.memory_flags(features), MemoryFlags::EXECUTABLE);
    }
}
