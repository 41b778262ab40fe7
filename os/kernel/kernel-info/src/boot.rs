//! # Boot Memory Map
//!
//! The physical memory description the loader hands over. Usable regions
//! become frame allocation spaces; everything else is fed through the frame
//! allocator's byte-range reservation.

/// Classification of a boot memory region.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootMemoryKind {
    /// General purpose RAM, free for the frame allocator.
    Usable = 0,
    /// Firmware-reserved; never hand out.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// Loader code and data still in use during early boot.
    Bootloader = 3,
    /// Memory-mapped I/O.
    Mmio = 4,
}

/// One contiguous physical range of the boot memory map.
///
/// Keep this `#[repr(C)]`; it crosses the loader/kernel boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootMemoryRegion {
    /// Physical start address.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// What the region may be used for.
    pub kind: BootMemoryKind,
}

impl BootMemoryRegion {
    #[must_use]
    pub const fn new(start: u64, length: u64, kind: BootMemoryKind) -> Self {
        Self {
            start,
            length,
            kind,
        }
    }

    /// End (exclusive) of the region, saturating at the top of memory.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, BootMemoryKind::Usable)
    }
}
