//! # Frame Allocation Space
//!
//! One contiguous range of physical memory, managed with a descriptor per
//! frame and an index stack.
//!
//! ```text
//!  memory_start                allocation_start                   memory_end
//!  │ control pages             │ allocable frames                          │
//!  ├───────────────────────────┼───────────────────────────────────────────┤
//!  │ descriptors │ stack       │ 0 │ 1 │ 2 │ …                              │
//! ```
//!
//! The stack holds frame indices in two adjacent segments:
//!
//! ```text
//!  0              free_top              cache_top          allocable
//!  ├── free frames ──┼── caching frames ──┼──── unused ──────┤
//! ```
//!
//! A frame's index is in the free segment iff its descriptor is
//! [`FrameStatus::Free`] and in the cache segment iff it is
//! [`FrameStatus::Caching`]; each descriptor remembers its slot so removal is
//! O(1). Allocation pops the free segment first and falls back to the cache.

use core::fmt;
use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{IntegrityViolation, MemoryError, MemoryResult};
use log::{info, warn};

/// Lifecycle state of a physical frame.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FrameStatus {
    /// On the free segment of the stack.
    Free = 0,
    /// Holds reclaimable data; on the cache segment of the stack.
    Caching = 1,
    /// Handed out.
    InUse = 2,
    /// Never handed out (firmware, MMIO holes, loader data).
    Reserved = 3,
}

/// Per-frame bookkeeping.
///
/// Keep this `#[repr(C)]` and 24 bytes; the control area is sized from it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameDescriptor {
    /// Opaque owner tag.
    pub source: u64,
    /// Opaque file-backing cookie; unused for now.
    pub file_page: u32,
    /// Position of this frame's index on the stack, when `Free` or `Caching`.
    pub stack_index: u32,
    /// Number of mappings and other holders.
    pub reference_count: u32,
    /// Saturating count of references taken since allocation.
    pub access_count: u16,
    status: FrameStatus,
    _reserved: u8,
}

const _: () = assert!(size_of::<FrameDescriptor>() == 24);

/// Stack slot; a frame index.
type StackSlot = u64;

/// Bytes of control data per allocable frame.
const CONTROL_BYTES_PER_FRAME: u64 = (size_of::<FrameDescriptor>() + size_of::<StackSlot>()) as u64;

impl FrameDescriptor {
    const fn new(stack_index: u32) -> Self {
        Self {
            source: 0,
            file_page: 0,
            stack_index,
            reference_count: 0,
            access_count: 0,
            status: FrameStatus::Free,
            _reserved: 0,
        }
    }

    #[must_use]
    pub const fn status(&self) -> FrameStatus {
        self.status
    }

    fn use_now(&mut self) {
        self.status = FrameStatus::InUse;
        self.reference_count = 0;
        self.access_count = 0;
    }
}

/// A physical range under a frame-stack allocator.
pub struct FrameAllocationSpace {
    memory_start: PhysicalAddress,
    memory_end: PhysicalAddress,
    allocation_start: PhysicalAddress,
    page_size: u64,
    page_count: usize,
    control_pages: usize,
    free: usize,
    in_use: usize,
    reserved: usize,
    caching: usize,
    free_top: usize,
    cache_top: usize,
    descriptors: &'static mut [FrameDescriptor],
    stack: &'static mut [StackSlot],
}

impl FrameAllocationSpace {
    /// Number of frames of `[start, end)` left for allocation after the
    /// control area is carved out.
    #[must_use]
    pub const fn allocable_for(start: PhysicalAddress, end: PhysicalAddress, page_size: u64) -> usize {
        let len = end.as_u64().saturating_sub(start.as_u64());
        (len / (page_size + CONTROL_BYTES_PER_FRAME)) as usize
    }

    /// Size in bytes of the control area [`FrameAllocationSpace::from_raw_parts`]
    /// expects for `[start, end)`.
    #[must_use]
    pub const fn control_bytes(start: PhysicalAddress, end: PhysicalAddress, page_size: u64) -> usize {
        Self::allocable_for(start, end, page_size) * CONTROL_BYTES_PER_FRAME as usize
    }

    /// Builds a space over `[start, end)` with every allocable frame free.
    ///
    /// The first frames of the range hold the control area and are never
    /// handed out.
    ///
    /// # Errors
    /// - [`MemoryError::AlignmentFailure`] if `page_size` is not a power of two
    ///   of at least 4 KiB, or the bounds are not page aligned.
    /// - [`MemoryError::ArgumentOutOfRange`] if no frame is left to allocate.
    ///
    /// # Safety
    /// `control` must be 8-byte aligned, valid for writes of
    /// [`FrameAllocationSpace::control_bytes`] bytes, and exclusively owned by
    /// the new space forever. It is normally the virtual mapping of the control
    /// pages at the start of the range.
    pub unsafe fn from_raw_parts(
        start: PhysicalAddress,
        end: PhysicalAddress,
        page_size: u64,
        control: NonNull<u8>,
    ) -> MemoryResult<Self> {
        if !page_size.is_power_of_two()
            || page_size < 0x1000
            || start.as_u64() % page_size != 0
            || end.as_u64() % page_size != 0
        {
            return Err(MemoryError::AlignmentFailure);
        }
        let allocable = Self::allocable_for(start, end, page_size);
        if allocable == 0 || u32::try_from(allocable).is_err() {
            return Err(MemoryError::ArgumentOutOfRange);
        }
        debug_assert!(control.as_ptr().align_offset(align_of::<FrameDescriptor>()) == 0);

        let page_count = ((end.as_u64() - start.as_u64()) / page_size) as usize;
        let control_pages = page_count - allocable;

        let descriptors = control.cast::<FrameDescriptor>();
        // SAFETY: the control area holds `allocable` descriptors followed by
        // `allocable` slots; both are plain data and initialized right here.
        let (descriptors, stack) = unsafe {
            let stack = descriptors.add(allocable).cast::<StackSlot>();
            for i in 0..allocable {
                #[allow(clippy::cast_possible_truncation)]
                descriptors.add(i).write(FrameDescriptor::new(i as u32));
                stack.add(i).write(i as StackSlot);
            }
            (
                core::slice::from_raw_parts_mut(descriptors.as_ptr(), allocable),
                core::slice::from_raw_parts_mut(stack.as_ptr(), allocable),
            )
        };

        let space = Self {
            memory_start: start,
            memory_end: end,
            allocation_start: start + control_pages as u64 * page_size,
            page_size,
            page_count,
            control_pages,
            free: allocable,
            in_use: 0,
            reserved: 0,
            caching: 0,
            free_top: allocable,
            cache_top: allocable,
            descriptors,
            stack,
        };
        info!(
            "frame space {start}..{end}: {allocable} allocable frames, {control_pages} control frames"
        );
        Ok(space)
    }

    #[must_use]
    pub const fn memory_start(&self) -> PhysicalAddress {
        self.memory_start
    }

    #[must_use]
    pub const fn memory_end(&self) -> PhysicalAddress {
        self.memory_end
    }

    /// First allocable frame, right after the control pages.
    #[must_use]
    pub const fn allocation_start(&self) -> PhysicalAddress {
        self.allocation_start
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// All frames of the range, control pages included.
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub const fn control_pages(&self) -> usize {
        self.control_pages
    }

    #[must_use]
    pub fn allocable_pages(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub const fn free_pages(&self) -> usize {
        self.free
    }

    #[must_use]
    pub const fn in_use_pages(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub const fn reserved_pages(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub const fn caching_pages(&self) -> usize {
        self.caching
    }

    /// Returns `true` if `pa` lies in the allocable part of this space.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.allocation_start && pa < self.memory_end
    }

    /// The descriptor of the frame containing `pa`.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] if `pa` is outside the space.
    pub fn descriptor(&self, pa: PhysicalAddress) -> MemoryResult<FrameDescriptor> {
        let index = self.containing_index(pa)?;
        Ok(self.descriptors[index])
    }

    /// Hands out one frame, preferring plain free frames over caching ones.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if both stack segments are empty.
    pub fn allocate_page(&mut self) -> MemoryResult<PhysicalAddress> {
        let index = if self.free_top > 0 {
            let index = self.slot(self.free_top - 1)?;
            self.free -= 1;
            index
        } else if self.cache_top > self.free_top {
            let index = self.slot(self.cache_top - 1)?;
            self.caching -= 1;
            index
        } else {
            return Err(MemoryError::OutOfMemory);
        };
        self.unlink(index);
        self.descriptors[index].use_now();
        self.in_use += 1;
        self.debug_check();
        Ok(self.address_of(index))
    }

    /// Hands out `count` physically contiguous frames.
    ///
    /// # Errors
    /// - [`MemoryError::ArgumentOutOfRange`] if `count` is zero.
    /// - [`MemoryError::OutOfMemory`] if no run of free or caching frames is
    ///   long enough.
    pub fn allocate_pages(&mut self, count: usize) -> MemoryResult<PhysicalAddress> {
        match count {
            0 => return Err(MemoryError::ArgumentOutOfRange),
            1 => return self.allocate_page(),
            _ => {}
        }

        let mut run = 0;
        let mut first = None;
        for (i, d) in self.descriptors.iter().enumerate() {
            if matches!(d.status, FrameStatus::Free | FrameStatus::Caching) {
                run += 1;
                if run == count {
                    first = Some(i + 1 - count);
                    break;
                }
            } else {
                run = 0;
            }
        }
        let first = first.ok_or(MemoryError::OutOfMemory)?;

        for index in first..first + count {
            match self.descriptors[index].status {
                FrameStatus::Free => self.free -= 1,
                _ => self.caching -= 1,
            }
            self.unlink(index);
            self.descriptors[index].use_now();
            self.in_use += 1;
        }
        self.debug_check();
        Ok(self.address_of(first))
    }

    /// Returns `count` frames starting at `pa` to the free segment.
    ///
    /// The whole range is checked first; on error nothing changed.
    ///
    /// # Errors
    /// - [`MemoryError::ArgumentOutOfRange`] / [`MemoryError::AlignmentFailure`]
    ///   for a range outside the space or a misaligned `pa`.
    /// - [`IntegrityViolation::DoubleFree`] if a frame is already free.
    /// - [`IntegrityViolation::FreeReserved`] if a frame is reserved.
    pub fn free_page_range(&mut self, pa: PhysicalAddress, count: usize) -> MemoryResult<()> {
        let first = self.range_start(pa, count)?;
        for index in first..first + count {
            match self.descriptors[index].status {
                FrameStatus::Free => {
                    return Err(MemoryError::integrity(IntegrityViolation::DoubleFree(
                        self.address_of(index),
                    )));
                }
                FrameStatus::Reserved => {
                    return Err(MemoryError::integrity(IntegrityViolation::FreeReserved(
                        self.address_of(index),
                    )));
                }
                FrameStatus::InUse | FrameStatus::Caching => {}
            }
        }

        for index in first..first + count {
            self.free_index(index);
        }
        self.debug_check();
        Ok(())
    }

    /// Takes `count` frames starting at `pa` out of circulation.
    ///
    /// With `only_free`, every frame must be free or nothing changes.
    /// Otherwise free and caching frames leave the stack, in-use frames are
    /// retagged and reserved frames stay as they are.
    ///
    /// # Errors
    /// - [`MemoryError::PageMapped`] if `only_free` and a frame is not free.
    /// - Range errors as for [`FrameAllocationSpace::free_page_range`].
    pub fn reserve_page_range(
        &mut self,
        pa: PhysicalAddress,
        count: usize,
        only_free: bool,
    ) -> MemoryResult<()> {
        let first = self.range_start(pa, count)?;
        if only_free
            && self.descriptors[first..first + count]
                .iter()
                .any(|d| d.status != FrameStatus::Free)
        {
            return Err(MemoryError::PageMapped);
        }

        for index in first..first + count {
            match self.descriptors[index].status {
                FrameStatus::Free => {
                    self.free -= 1;
                    self.unlink(index);
                }
                FrameStatus::Caching => {
                    self.caching -= 1;
                    self.unlink(index);
                }
                FrameStatus::InUse => {
                    warn!("reserving in-use frame {}", self.address_of(index));
                    self.in_use -= 1;
                }
                FrameStatus::Reserved => continue,
            }
            self.descriptors[index].status = FrameStatus::Reserved;
            self.reserved += 1;
        }
        self.debug_check();
        Ok(())
    }

    /// Reserves every frame overlapping `[pa, pa + len)`, clamped to the
    /// allocable part of the space.
    ///
    /// # Errors
    /// See [`FrameAllocationSpace::reserve_page_range`].
    pub fn reserve_byte_range(
        &mut self,
        pa: PhysicalAddress,
        len: u64,
        only_free: bool,
    ) -> MemoryResult<()> {
        let mask = self.page_size - 1;
        let start = (pa.as_u64() & !mask).max(self.allocation_start.as_u64());
        let end = pa
            .as_u64()
            .saturating_add(len)
            .saturating_add(mask)
            & !mask;
        let end = end.min(self.memory_end.as_u64());
        if start >= end {
            return Ok(());
        }
        let count = ((end - start) / self.page_size) as usize;
        self.reserve_page_range(PhysicalAddress::new(start), count, only_free)
    }

    /// Moves an unreferenced in-use frame onto the cache segment.
    ///
    /// # Errors
    /// [`MemoryError::PageMapped`] if the frame is not in use or still
    /// referenced.
    pub fn mark_caching(&mut self, pa: PhysicalAddress) -> MemoryResult<()> {
        let index = self.frame_index(pa)?;
        let d = &self.descriptors[index];
        if d.status != FrameStatus::InUse || d.reference_count != 0 {
            return Err(MemoryError::PageMapped);
        }
        self.in_use -= 1;
        self.caching += 1;
        self.push_cache(index);
        self.descriptors[index].status = FrameStatus::Caching;
        self.debug_check();
        Ok(())
    }

    /// Adds a reference to the in-use frame at `pa`; returns the new count.
    ///
    /// # Errors
    /// - Range errors for an address outside the space.
    /// - [`MemoryError::ArgumentOutOfRange`] for a frame that is not in use;
    ///   the next allocation would reset its count.
    pub fn retain(&mut self, pa: PhysicalAddress) -> MemoryResult<u32> {
        let index = self.frame_index(pa)?;
        let d = &mut self.descriptors[index];
        if d.status != FrameStatus::InUse {
            return Err(MemoryError::ArgumentOutOfRange);
        }
        d.reference_count = d.reference_count.saturating_add(1);
        d.access_count = d.access_count.saturating_add(1);
        Ok(d.reference_count)
    }

    /// Drops a reference to the frame at `pa`; returns the new count.
    ///
    /// An in-use frame whose count reaches zero is freed.
    ///
    /// # Errors
    /// [`IntegrityViolation::ReferenceUnderflow`] if the count is already zero.
    pub fn release(&mut self, pa: PhysicalAddress) -> MemoryResult<u32> {
        let index = self.frame_index(pa)?;
        let d = &mut self.descriptors[index];
        if d.reference_count == 0 {
            return Err(MemoryError::integrity(
                IntegrityViolation::ReferenceUnderflow(pa),
            ));
        }
        d.reference_count -= 1;
        let remaining = d.reference_count;
        if remaining == 0 && d.status == FrameStatus::InUse {
            self.free_index(index);
            self.debug_check();
        }
        Ok(remaining)
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.allocation_start + index as u64 * self.page_size
    }

    /// Index of the frame containing `pa`.
    fn containing_index(&self, pa: PhysicalAddress) -> MemoryResult<usize> {
        if !self.contains(pa) {
            return Err(MemoryError::ArgumentOutOfRange);
        }
        Ok(((pa.as_u64() - self.allocation_start.as_u64()) / self.page_size) as usize)
    }

    /// Index of the frame starting at `pa`.
    fn frame_index(&self, pa: PhysicalAddress) -> MemoryResult<usize> {
        if pa.as_u64() % self.page_size != 0 {
            return Err(MemoryError::AlignmentFailure);
        }
        self.containing_index(pa)
    }

    fn range_start(&self, pa: PhysicalAddress, count: usize) -> MemoryResult<usize> {
        let first = self.frame_index(pa)?;
        if count == 0 || first + count > self.descriptors.len() {
            return Err(MemoryError::ArgumentOutOfRange);
        }
        Ok(first)
    }

    /// Reads a stack slot, validating the index it holds.
    fn slot(&self, position: usize) -> MemoryResult<usize> {
        let index = usize::try_from(self.stack[position]).unwrap_or(usize::MAX);
        if index >= self.descriptors.len() || self.descriptors[index].stack_index as usize != position {
            return Err(MemoryError::integrity(IntegrityViolation::CorruptStack(position)));
        }
        Ok(index)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn move_slot(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let index = self.stack[from];
        self.stack[to] = index;
        self.descriptors[index as usize].stack_index = to as u32;
    }

    /// Removes a free or caching frame from the stack, keeping both segments
    /// contiguous. Counters are the caller's business.
    fn unlink(&mut self, index: usize) {
        let position = self.descriptors[index].stack_index as usize;
        match self.descriptors[index].status {
            FrameStatus::Free => {
                let last_free = self.free_top - 1;
                self.move_slot(last_free, position);
                self.move_slot(self.cache_top - 1, last_free);
                self.free_top -= 1;
                self.cache_top -= 1;
            }
            FrameStatus::Caching => {
                self.move_slot(self.cache_top - 1, position);
                self.cache_top -= 1;
            }
            FrameStatus::InUse | FrameStatus::Reserved => {
                debug_assert!(false, "unlinking a frame that is not on the stack");
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_free(&mut self, index: usize) {
        // The first caching frame moves to the end of its segment.
        self.move_slot(self.free_top, self.cache_top);
        self.stack[self.free_top] = index as StackSlot;
        self.descriptors[index].stack_index = self.free_top as u32;
        self.free_top += 1;
        self.cache_top += 1;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_cache(&mut self, index: usize) {
        self.stack[self.cache_top] = index as StackSlot;
        self.descriptors[index].stack_index = self.cache_top as u32;
        self.cache_top += 1;
    }

    /// Moves an in-use or caching frame to the free segment.
    fn free_index(&mut self, index: usize) {
        match self.descriptors[index].status {
            FrameStatus::InUse => self.in_use -= 1,
            FrameStatus::Caching => {
                self.caching -= 1;
                self.unlink(index);
            }
            FrameStatus::Free | FrameStatus::Reserved => return,
        }
        let d = &mut self.descriptors[index];
        d.status = FrameStatus::Free;
        d.reference_count = 0;
        self.free += 1;
        self.push_free(index);
    }

    fn debug_check(&self) {
        debug_assert_eq!(
            self.free + self.in_use + self.reserved + self.caching,
            self.descriptors.len(),
            "frame counters out of balance"
        );
        debug_assert_eq!(self.free_top, self.free);
        debug_assert_eq!(self.cache_top - self.free_top, self.caching);
    }
}

impl fmt::Display for FrameAllocationSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "space {}..{} (alloc from {}), {} B pages",
            self.memory_start, self.memory_end, self.allocation_start, self.page_size
        )?;
        writeln!(
            f,
            "  allocable {} | free {} | in use {} | caching {} | reserved {} | control {}",
            self.descriptors.len(),
            self.free,
            self.in_use,
            self.caching,
            self.reserved,
            self.control_pages
        )?;
        write!(f, "  free stack:")?;
        for slot in &self.stack[..self.free_top] {
            write!(f, " {slot}")?;
        }
        write!(f, "\n  cache stack:")?;
        for slot in &self.stack[self.free_top..self.cache_top] {
            write!(f, " {slot}")?;
        }
        writeln!(f)
    }
}
