//! # Physical Frame Allocator
//!
//! Physical memory is split into up to [`MAX_SPACES`] allocation spaces, one
//! per usable range of the boot memory map. Each [`FrameAllocationSpace`] sits
//! behind its own spin lock; every public operation holds that lock for its
//! whole duration and never takes another lock inside it.
//!
//! Frames mapped into page tables are reference counted through
//! [`FrameLease`]: taking a lease retains the frame, dropping it releases, and
//! a mapping keeps its reference by converting the lease with
//! [`FrameLease::into_mapping`].

mod space;

pub use space::{FrameAllocationSpace, FrameDescriptor, FrameStatus};

use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::boot::BootMemoryRegion;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinMutex;
use kernel_vmem::{FrameAlloc, MemoryError, MemoryResult};
use log::{debug, info};

/// Maximum number of allocation spaces.
pub const MAX_SPACES: usize = 16;

/// Highest physical address (exclusive) usable by 32-bit DMA.
const FOUR_GIB: u64 = 0x1_0000_0000;

/// Constraints on where a frame may come from.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AllocationOptions {
    /// Anywhere.
    #[default]
    General,
    /// Only from spaces entirely below 4 GiB.
    ThirtyTwoBit,
}

/// Aggregated counters over all spaces.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub spaces: usize,
    pub allocable: usize,
    pub free: usize,
    pub in_use: usize,
    pub caching: usize,
    pub reserved: usize,
    pub control: usize,
}

/// The physical frame allocator.
pub struct FrameAllocator {
    spaces: [SpinMutex<Option<FrameAllocationSpace>>; MAX_SPACES],
    count: AtomicUsize,
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            spaces: [const { SpinMutex::new(None) }; MAX_SPACES],
            count: AtomicUsize::new(0),
        }
    }

    /// Registers a space. Boot-time only.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] if all slots are taken or the space
    /// overlaps a registered one.
    pub fn add_space(&self, space: FrameAllocationSpace) -> MemoryResult<()> {
        let overlaps = self.spaces().any(|slot| {
            slot.lock_irq().as_ref().is_some_and(|other| {
                space.memory_start() < other.memory_end() && other.memory_start() < space.memory_end()
            })
        });
        if overlaps {
            return Err(MemoryError::ArgumentOutOfRange);
        }

        let index = self.count.load(Ordering::Acquire);
        let slot = self.spaces.get(index).ok_or(MemoryError::ArgumentOutOfRange)?;
        info!(
            "frame space #{index}: {}..{}",
            space.memory_start(),
            space.memory_end()
        );
        *slot.lock_irq() = Some(space);
        self.count.store(index + 1, Ordering::Release);
        Ok(())
    }

    fn spaces(&self) -> impl Iterator<Item = &SpinMutex<Option<FrameAllocationSpace>>> {
        self.spaces.iter().take(self.count.load(Ordering::Acquire))
    }

    /// Runs `f` on the space owning `pa`.
    fn with_owner<U>(
        &self,
        pa: PhysicalAddress,
        f: impl FnOnce(&mut FrameAllocationSpace) -> U,
    ) -> Option<U> {
        for slot in self.spaces() {
            let mut guard = slot.lock_irq();
            if let Some(space) = guard.as_mut().filter(|s| s.contains(pa)) {
                return Some(f(space));
            }
        }
        None
    }

    fn eligible(space: &FrameAllocationSpace, options: AllocationOptions) -> bool {
        match options {
            AllocationOptions::General => true,
            AllocationOptions::ThirtyTwoBit => space.memory_end().as_u64() <= FOUR_GIB,
        }
    }

    /// Allocates one frame from the first space that has one.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if no eligible space has a frame left.
    pub fn allocate(&self, options: AllocationOptions) -> MemoryResult<PhysicalAddress> {
        for slot in self.spaces() {
            let mut guard = slot.lock_irq();
            let Some(space) = guard.as_mut().filter(|s| Self::eligible(s, options)) else {
                continue;
            };
            match space.allocate_page() {
                Ok(pa) => return Ok(pa),
                Err(MemoryError::OutOfMemory) => {}
                Err(e) => return Err(e),
            }
        }
        Err(MemoryError::OutOfMemory)
    }

    /// Allocates `count` physically contiguous frames from a single space.
    ///
    /// # Errors
    /// - [`MemoryError::ArgumentOutOfRange`] for `count == 0`.
    /// - [`MemoryError::OutOfMemory`] if no space has a long enough run.
    pub fn allocate_contiguous(
        &self,
        count: usize,
        options: AllocationOptions,
    ) -> MemoryResult<PhysicalAddress> {
        if count == 0 {
            return Err(MemoryError::ArgumentOutOfRange);
        }
        for slot in self.spaces() {
            let mut guard = slot.lock_irq();
            let Some(space) = guard.as_mut().filter(|s| Self::eligible(s, options)) else {
                continue;
            };
            match space.allocate_pages(count) {
                Ok(pa) => return Ok(pa),
                Err(MemoryError::OutOfMemory) => {}
                Err(e) => return Err(e),
            }
        }
        Err(MemoryError::OutOfMemory)
    }

    /// Returns `count` frames starting at `pa`.
    ///
    /// # Errors
    /// - [`MemoryError::ArgumentOutOfRange`] if `pa` belongs to no space.
    /// - Everything [`FrameAllocationSpace::free_page_range`] reports.
    pub fn free_range(&self, pa: PhysicalAddress, count: usize) -> MemoryResult<()> {
        self.with_owner(pa, |s| s.free_page_range(pa, count))
            .unwrap_or(Err(MemoryError::ArgumentOutOfRange))
    }

    /// Returns the frame at `pa`.
    ///
    /// # Errors
    /// See [`FrameAllocator::free_range`].
    pub fn free(&self, pa: PhysicalAddress) -> MemoryResult<()> {
        self.free_range(pa, 1)
    }

    /// Reserves `[pa, pa + len)` in every space it overlaps.
    ///
    /// # Errors
    /// [`MemoryError::PageMapped`] if `only_free` and a frame is not free.
    pub fn reserve_byte_range(
        &self,
        pa: PhysicalAddress,
        len: u64,
        only_free: bool,
    ) -> MemoryResult<()> {
        for slot in self.spaces() {
            if let Some(space) = slot.lock_irq().as_mut() {
                space.reserve_byte_range(pa, len, only_free)?;
            }
        }
        Ok(())
    }

    /// Reserves every non-usable region of the boot memory map.
    ///
    /// # Errors
    /// See [`FrameAllocator::reserve_byte_range`].
    pub fn reserve_regions(&self, regions: &[BootMemoryRegion]) -> MemoryResult<()> {
        for region in regions.iter().filter(|r| !r.is_usable()) {
            debug!(
                "reserving {:?} region {:#x}..{:#x}",
                region.kind,
                region.start,
                region.end()
            );
            self.reserve_byte_range(PhysicalAddress::new(region.start), region.length, false)?;
        }
        Ok(())
    }

    /// Moves an unreferenced in-use frame onto its space's cache segment.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] outside every space, or what
    /// [`FrameAllocationSpace::mark_caching`] reports.
    pub fn mark_caching(&self, pa: PhysicalAddress) -> MemoryResult<()> {
        self.with_owner(pa, |s| s.mark_caching(pa))
            .unwrap_or(Err(MemoryError::ArgumentOutOfRange))
    }

    /// Takes a reference to the frame at `pa`.
    ///
    /// Returns `None` for addresses outside every space (MMIO, firmware) and
    /// for frames that are not allocated.
    #[must_use]
    pub fn retain(&self, pa: PhysicalAddress) -> Option<FrameLease<'_>> {
        let frame = PhysicalAddress::new(pa.as_u64() & !0xFFF);
        match self.with_owner(frame, |s| s.retain(frame))? {
            Ok(_) => Some(FrameLease {
                allocator: self,
                frame,
            }),
            Err(_) => None,
        }
    }

    /// Drops a reference; addresses outside every space are ignored.
    fn release(&self, frame: PhysicalAddress) -> MemoryResult<()> {
        self.with_owner(frame, |s| s.release(frame).map(|_| ()))
            .unwrap_or(Ok(()))
    }

    /// Current reference count of the frame at `pa`.
    #[must_use]
    pub fn reference_count(&self, pa: PhysicalAddress) -> Option<u32> {
        self.with_owner(pa, |s| s.descriptor(pa).ok().map(|d| d.reference_count))
            .flatten()
    }

    /// Current status of the frame at `pa`.
    #[must_use]
    pub fn status(&self, pa: PhysicalAddress) -> Option<FrameStatus> {
        self.with_owner(pa, |s| s.descriptor(pa).ok().map(|d| d.status()))
            .flatten()
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let mut stats = FrameStats::default();
        for slot in self.spaces() {
            if let Some(space) = slot.lock_irq().as_ref() {
                stats.spaces += 1;
                stats.allocable += space.allocable_pages();
                stats.free += space.free_pages();
                stats.in_use += space.in_use_pages();
                stats.caching += space.caching_pages();
                stats.reserved += space.reserved_pages();
                stats.control += space.control_pages();
            }
        }
        stats
    }
}

impl FrameAlloc for FrameAllocator {
    fn allocate_table_frame(&self) -> MemoryResult<PhysicalPage<Size4K>> {
        let pa = self.allocate(AllocationOptions::General)?;
        Ok(PhysicalPage::from_addr(pa))
    }
}

/// One reference to a physical frame.
///
/// Dropping the lease releases the reference; the frame is freed when the
/// last reference of an in-use frame goes away.
#[must_use = "dropping a lease releases the frame reference"]
pub struct FrameLease<'a> {
    allocator: &'a FrameAllocator,
    frame: PhysicalAddress,
}

impl<'a> FrameLease<'a> {
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.frame
    }

    /// Releases the reference now, reporting failures.
    ///
    /// # Errors
    /// [`kernel_vmem::IntegrityViolation::ReferenceUnderflow`].
    pub fn release(self) -> MemoryResult<()> {
        let this = ManuallyDrop::new(self);
        this.allocator.release(this.frame)
    }

    /// Hands the reference to a page-table mapping.
    ///
    /// The count stays raised until [`FrameLease::from_mapping`] takes it back.
    #[must_use]
    pub fn into_mapping(self) -> PhysicalAddress {
        let this = ManuallyDrop::new(self);
        this.frame
    }

    /// Takes back the reference a removed mapping held.
    ///
    /// # Safety
    /// `frame` must come from [`FrameLease::into_mapping`] on the same
    /// allocator, and each such reference may be reclaimed only once.
    pub const unsafe fn from_mapping(allocator: &'a FrameAllocator, frame: PhysicalAddress) -> Self {
        Self { allocator, frame }
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        // Integrity failures are logged inside; nothing else to do here.
        let _ = self.allocator.release(self.frame);
    }
}
