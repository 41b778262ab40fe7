//! # Memory Manager
//!
//! [`MemoryManager`] is the kernel memory context: it ties the MMU, the frame
//! allocator and the zone partition together and is the only place where page
//! mapping, frame reference counting and locking meet.
//!
//! ## Locking
//!
//! Every operation takes at most one zone lock, chosen by the address it
//! touches. Operations on the user half of an inactive process space also
//! take the alien lock, which serializes use of the alien window. The order is
//! always alien lock, zone lock, frame-space lock.
//!
//! ## Reference counting
//!
//! A frame mapped with [`MemoryManager::map_page`] gains one reference,
//! handed to the page tables with [`FrameLease::into_mapping`];
//! [`MemoryManager::unmap_page`] takes it back and releases it, freeing the
//! frame when nothing else holds it. Every page-table frame created on the way
//! is retained once and never reclaimed.
//!
//! Counts only change once the zone lock is released. Operations spanning
//! many pages gather their frames in a fixed-size [`Batch`] per lock hold.

use crate::frame_alloc::{AllocationOptions, FrameAllocator, FrameLease, FrameStatus};
use crate::process::ProcessSpace;
use crate::zones::{ZoneGuard, ZoneId, ZonePartition};
use core::fmt;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{IrqMutex, LockStats, RawTicket, TicketMutex};
use kernel_vmem::{
    AddressSpace, FrameSize, IntegrityViolation, MapOptions, MemoryError, MemoryFlags,
    MemoryResult, Mmu, NewTables, PageMapper, PagingFeatures, SelfMapWindow, TableLevel,
};
use log::{debug, info, warn};

/// Pages handled per zone-lock hold by operations that count references.
const BATCH_PAGES: usize = 16;

/// Frames and tables gathered under a zone lock whose reference counts are
/// settled after it is released.
struct Batch {
    frames: [PhysicalAddress; BATCH_PAGES],
    len: usize,
    tables: [NewTables; BATCH_PAGES],
    maps: usize,
    /// An allocated frame whose mapping failed.
    stray: Option<PhysicalAddress>,
}

impl Batch {
    const fn new() -> Self {
        Self {
            frames: [PhysicalAddress::new(0); BATCH_PAGES],
            len: 0,
            tables: [const { NewTables::new() }; BATCH_PAGES],
            maps: 0,
            stray: None,
        }
    }

    const fn is_full(&self) -> bool {
        self.maps == BATCH_PAGES || self.len == BATCH_PAGES
    }

    fn record_map(&mut self, tables: NewTables) {
        self.tables[self.maps] = tables;
        self.maps += 1;
    }

    fn push_frame(&mut self, pa: PhysicalAddress) {
        self.frames[self.len] = pa;
        self.len += 1;
    }

    fn frames(&self) -> &[PhysicalAddress] {
        &self.frames[..self.len]
    }

    fn tables(&self) -> impl Iterator<Item = PhysicalPage<Size4K>> + '_ {
        self.tables[..self.maps].iter().flat_map(NewTables::iter)
    }
}

/// A window to operate through, plus the alien lock if it is the alien one.
struct Access<'g> {
    window: SelfMapWindow,
    _alien: Option<IrqMutex<'g, (), RawTicket>>,
}

/// The kernel memory context.
pub struct MemoryManager<'a, M: Mmu> {
    mmu: &'a M,
    frames: &'a FrameAllocator,
    features: PagingFeatures,
    local: SelfMapWindow,
    alien: SelfMapWindow,
    alien_lock: TicketMutex<()>,
    zones: ZonePartition,
    kernel: ProcessSpace,
}

impl<'a, M: Mmu> MemoryManager<'a, M> {
    /// Adopts the active, self-mapped root as the kernel address space.
    ///
    /// Every kernel-half PML4 slot is populated here, so kernel mappings are
    /// shared by all spaces created later.
    ///
    /// # Errors
    /// Allocation failures and window integrity failures.
    pub fn bootstrap(
        mmu: &'a M,
        frames: &'a FrameAllocator,
        features: PagingFeatures,
    ) -> MemoryResult<Self> {
        let vas = AddressSpace::bootstrap_kernel(mmu, frames, |table| {
            hand_to_tables(frames, table.base());
        })?;
        hand_to_tables(frames, vas.root().base());

        let stats = frames.stats();
        info!(
            "memory manager ready: {} of {} frames free, nx={} global={}",
            stats.free,
            stats.allocable,
            features.nx(),
            features.global_pages()
        );

        Ok(Self {
            mmu,
            frames,
            features,
            local: SelfMapWindow::local(),
            alien: SelfMapWindow::alien(),
            alien_lock: TicketMutex::new(()),
            zones: ZonePartition::new(),
            kernel: ProcessSpace::new(vas),
        })
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &ProcessSpace {
        &self.kernel
    }

    #[must_use]
    pub const fn frames(&self) -> &'a FrameAllocator {
        self.frames
    }

    #[must_use]
    pub const fn mmu(&self) -> &'a M {
        self.mmu
    }

    #[must_use]
    pub const fn features(&self) -> PagingFeatures {
        self.features
    }

    #[must_use]
    pub const fn zones(&self) -> &ZonePartition {
        &self.zones
    }

    /// Maps the 4 KiB page at `va` to the frame at `pa`.
    ///
    /// The frame gains one reference unless
    /// [`MapOptions::NO_REFERENCE_COUNTING`] is given. A counted frame inside
    /// an allocation space must be allocated; frames outside every space are
    /// never counted.
    ///
    /// # Errors
    /// - [`MemoryError::AlignmentFailure`] for unaligned addresses.
    /// - [`MemoryError::ArgumentOutOfRange`] for addresses outside every zone,
    ///   or a counted frame that is free, caching or reserved.
    /// - [`MemoryError::PageMapped`] if `va` is mapped already.
    /// - Allocation failures for intermediate tables.
    pub fn map_page(
        &self,
        space: &ProcessSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MemoryFlags,
        options: MapOptions,
    ) -> MemoryResult<()> {
        let zone = page_zone(va)?;
        if !pa.is_aligned::<Size4K>() {
            return Err(MemoryError::AlignmentFailure);
        }
        let counted = !options.contains(MapOptions::NO_REFERENCE_COUNTING);
        if counted && self.frames.status(pa).is_some_and(|s| s != FrameStatus::InUse) {
            return Err(MemoryError::ArgumentOutOfRange);
        }

        let mut new_tables = NewTables::new();
        let result = {
            let access = self.access(space, zone)?;
            let _zone = self.lock_zone(space, zone)?;
            self.mapper(access.window)
                .map(self.frames, va, pa, FrameSize::Size4K, flags, &mut new_tables)
        };
        self.adopt_tables(new_tables.iter());
        result?;

        if counted {
            hand_to_tables(self.frames, pa);
        }
        if !options.contains(MapOptions::NO_INVALIDATION) {
            self.mmu.invalidate_page(va);
        }
        debug!("mapped {va} -> {pa} {flags:?}");
        Ok(())
    }

    /// Removes the mapping of the page at `va` and returns its frame.
    ///
    /// The page is shot down after the zone lock is released, then the
    /// mapping's reference is dropped, freeing an unreferenced frame.
    ///
    /// # Errors
    /// - [`IntegrityViolation::UnmapUnmapped`] if `va` is not mapped.
    /// - [`IntegrityViolation::ReferenceUnderflow`] if the frame was mapped
    ///   without reference counting but unmapped with it.
    pub fn unmap_page(
        &self,
        space: &ProcessSpace,
        va: VirtualAddress,
        options: MapOptions,
    ) -> MemoryResult<PhysicalAddress> {
        let zone = page_zone(va)?;
        let unmapped = {
            let access = self.access(space, zone)?;
            let _zone = self.lock_zone(space, zone)?;
            self.mapper(access.window).unmap(va)?
        };

        if !options.contains(MapOptions::NO_INVALIDATION) {
            self.mmu.shootdown(va);
        }
        if !options.contains(MapOptions::NO_REFERENCE_COUNTING) {
            // SAFETY: the mapping carried the reference taken in `map_page`.
            unsafe { FrameLease::from_mapping(self.frames, unmapped.address) }.release()?;
        }
        debug!("unmapped {va} (was {})", unmapped.address);
        Ok(unmapped.address)
    }

    /// The physical address `va` translates to in `space`.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for addresses outside every zone.
    pub fn try_translate(
        &self,
        space: &ProcessSpace,
        va: VirtualAddress,
    ) -> MemoryResult<Option<PhysicalAddress>> {
        let zone = ZoneId::classify(va)?;
        let access = self.access(space, zone)?;
        let _zone = self.lock_zone(space, zone)?;
        self.mapper(access.window).translate(va)
    }

    /// Allocates `count` pages of fresh frames at the next free addresses of
    /// `zone` and maps them with `flags`.
    ///
    /// A failure part way through unmaps and frees every page mapped so far.
    ///
    /// # Errors
    /// - [`MemoryError::ArgumentOutOfRange`] for `count == 0` or more than the
    ///   zone holds.
    /// - [`MemoryError::OutOfMemory`] if frames run out.
    /// - [`MemoryError::PageMapped`] if the cursor wrapped onto live pages.
    pub fn allocate_pages(
        &self,
        space: &ProcessSpace,
        count: usize,
        zone: ZoneId,
        flags: MemoryFlags,
    ) -> MemoryResult<VirtualAddress> {
        let bytes = byte_length(count)?;
        let start = self.lock_zone(space, zone)?.advance(bytes)?;

        let mut mapped = 0;
        while mapped < count {
            let mut batch = Batch::new();
            let first = start + mapped as u64 * PAGE_SIZE;
            let result = self.allocate_batch(space, zone, first, count - mapped, flags, &mut batch);
            mapped += batch.frames().len();
            self.settle_allocated(&batch);

            if let Err(e) = result {
                warn!("allocating {count} pages in {zone:?} failed at page {mapped}: {e}");
                if let Err(undo) = self.release_pages(space, zone, start, mapped) {
                    warn!("rolling back {mapped} pages at {start}: {undo}");
                }
                return Err(e);
            }
        }

        debug!("allocated {count} pages at {start} in {zone:?}");
        Ok(start)
    }

    /// Unmaps `count` pages starting at `va` and releases their frames.
    ///
    /// Nothing changes unless every page is mapped. Once unmapping starts,
    /// every page is unmapped and released even if a release fails; the first
    /// such failure is reported.
    ///
    /// # Errors
    /// - [`IntegrityViolation::UnmapUnmapped`] for the first unmapped page.
    /// - [`MemoryError::ArgumentOutOfRange`] if the range crosses zones.
    /// - [`IntegrityViolation::ReferenceUnderflow`] if a page was mapped
    ///   without reference counting.
    pub fn free_pages(
        &self,
        space: &ProcessSpace,
        va: VirtualAddress,
        count: usize,
    ) -> MemoryResult<()> {
        let bytes = byte_length(count)?;
        let zone = range_zone(va, bytes)?;
        {
            let access = self.access(space, zone)?;
            let _zone = self.lock_zone(space, zone)?;
            let mapper = self.mapper(access.window);

            for index in 0..count as u64 {
                let page = va + index * PAGE_SIZE;
                match mapper.entry(page)? {
                    None => {
                        return Err(MemoryError::integrity(
                            IntegrityViolation::UnmapUnmapped(page),
                        ));
                    }
                    Some(entry) if entry.size != FrameSize::Size4K => {
                        return Err(MemoryError::AlignmentFailure);
                    }
                    Some(_) => {}
                }
            }
        }

        self.release_pages(space, zone, va, count)?;
        debug!("freed {count} pages at {va}");
        Ok(())
    }

    /// The permissions of the page containing `va`.
    ///
    /// # Errors
    /// [`MemoryError::PageNotMapped`] if nothing maps `va`.
    pub fn page_flags(&self, space: &ProcessSpace, va: VirtualAddress) -> MemoryResult<MemoryFlags> {
        let zone = ZoneId::classify(va)?;
        let access = self.access(space, zone)?;
        let _zone = self.lock_zone(space, zone)?;
        self.mapper(access.window).page_flags(va)
    }

    /// Rewrites the permissions of the page containing `va` and shoots it
    /// down.
    ///
    /// # Errors
    /// [`MemoryError::PageNotMapped`] if nothing maps `va`.
    pub fn set_page_flags(
        &self,
        space: &ProcessSpace,
        va: VirtualAddress,
        flags: MemoryFlags,
    ) -> MemoryResult<()> {
        let zone = ZoneId::classify(va)?;
        {
            let access = self.access(space, zone)?;
            let _zone = self.lock_zone(space, zone)?;
            self.mapper(access.window).set_page_flags(va, flags)?;
        }
        self.mmu.shootdown(va.align_down::<Size4K>());
        debug!("flags of {va} now {flags:?}");
        Ok(())
    }

    /// Maps `len` bytes of physical memory at `pa` to `va`.
    ///
    /// Uses 2 MiB pages wherever both addresses and the remaining length
    /// allow it. Frames are not reference counted; this is meant for MMIO,
    /// firmware tables and the kernel image. A failure unmaps what was mapped.
    ///
    /// # Errors
    /// - [`MemoryError::AlignmentFailure`] unless `va`, `pa` and `len` are
    ///   page aligned.
    /// - [`MemoryError::ArgumentOutOfRange`] for an empty range or one that
    ///   crosses zones.
    /// - [`MemoryError::PageMapped`] if any part is mapped already.
    pub fn map_range(
        &self,
        space: &ProcessSpace,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        flags: MemoryFlags,
    ) -> MemoryResult<()> {
        if !pa.is_aligned::<Size4K>() || !FrameSize::Size4K.is_aligned(len) {
            return Err(MemoryError::AlignmentFailure);
        }
        let zone = range_zone(va, len)?;

        let mut offset = 0;
        while offset < len {
            let mut batch = Batch::new();
            let result = self.map_range_batch(space, zone, va, pa, len, &mut offset, flags, &mut batch);
            self.adopt_tables(batch.tables());
            if let Err(e) = result {
                if let Err(undo) = self.unmap_leaves(space, zone, va, offset) {
                    warn!("rolling back {offset:#x} bytes at {va}: {undo}");
                }
                return Err(e);
            }
        }

        debug!("mapped {len:#x} bytes {va} -> {pa} {flags:?}");
        Ok(())
    }

    /// Removes the mappings [`MemoryManager::map_range`] created.
    ///
    /// Nothing changes unless the whole range is mapped by leaves that lie
    /// entirely inside it.
    ///
    /// # Errors
    /// - [`IntegrityViolation::UnmapUnmapped`] for the first hole.
    /// - [`MemoryError::AlignmentFailure`] if a large leaf sticks out of the
    ///   range.
    pub fn unmap_range(&self, space: &ProcessSpace, va: VirtualAddress, len: u64) -> MemoryResult<()> {
        if !FrameSize::Size4K.is_aligned(len) {
            return Err(MemoryError::AlignmentFailure);
        }
        let zone = range_zone(va, len)?;
        let access = self.access(space, zone)?;
        let _zone = self.lock_zone(space, zone)?;
        let mapper = self.mapper(access.window);

        let mut offset = 0;
        while offset < len {
            let page = va + offset;
            let Some(entry) = mapper.entry(page)? else {
                return Err(MemoryError::integrity(
                    IntegrityViolation::UnmapUnmapped(page),
                ));
            };
            if !entry.size.is_aligned(page.as_u64()) || entry.size.bytes() > len - offset {
                return Err(MemoryError::AlignmentFailure);
            }
            offset += entry.size.bytes();
        }

        let mut offset = 0;
        while offset < len {
            let page = va + offset;
            let unmapped = mapper.unmap(page)?;
            self.mmu.shootdown(page);
            offset += unmapped.size.bytes();
        }

        debug!("unmapped {len:#x} bytes at {va}");
        Ok(())
    }

    /// Builds a new process space sharing the kernel half.
    ///
    /// # Errors
    /// Allocation failures and window integrity failures.
    pub fn create_process_space(&self) -> MemoryResult<ProcessSpace> {
        let vas = {
            let _alien = self.alien_lock.lock_irq();
            // SAFETY: the alien lock is held, and every active root descends
            // from the kernel's.
            unsafe { AddressSpace::create(self.mmu, self.frames)? }
        };
        hand_to_tables(self.frames, vas.root().base());
        Ok(ProcessSpace::new(vas))
    }

    /// Loads `space` on the executing core.
    ///
    /// # Safety
    /// See [`Mmu::activate`]: the code and stack in use must be mapped in
    /// `space`, which holds for the kernel half.
    pub unsafe fn activate(&self, space: &ProcessSpace) {
        // SAFETY: forwarded from the caller.
        unsafe { space.address_space().activate(self.mmu) };
    }

    #[must_use]
    pub fn is_active(&self, space: &ProcessSpace) -> bool {
        space.is_active(self.mmu)
    }

    /// Writes the table of `level` holding the entry for `va` to `sink`.
    ///
    /// Returns the number of present entries, or `None` if the table does not
    /// exist.
    ///
    /// # Errors
    /// - [`MemoryError::UnsupportedOperation`] for the user half of an
    ///   inactive space, or if `sink` fails.
    /// - [`MemoryError::ArgumentOutOfRange`] for addresses outside every zone.
    pub fn dump_level(
        &self,
        space: &ProcessSpace,
        va: VirtualAddress,
        level: TableLevel,
        sink: &mut impl fmt::Write,
    ) -> MemoryResult<Option<usize>> {
        let zone = ZoneId::classify(va)?;
        if zone == ZoneId::User && !space.is_active(self.mmu) {
            return Err(MemoryError::UnsupportedOperation);
        }
        let _zone = self.lock_zone(space, zone)?;
        let Some(dump) = self.mapper(self.local).dump_level(va, level)? else {
            return Ok(None);
        };
        write!(sink, "{dump}").map_err(|_| MemoryError::UnsupportedOperation)?;
        Ok(Some(dump.present()))
    }

    /// Contention counters of the lock guarding `zone`.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for a core index past the last
    /// core.
    pub fn zone_stats(&self, space: &ProcessSpace, zone: ZoneId) -> MemoryResult<LockStats> {
        self.zones.stats(zone, space.user_lock())
    }

    /// Picks the window for `zone` of `space`, alienating the space if its
    /// user half is not reachable locally.
    fn access(&self, space: &ProcessSpace, zone: ZoneId) -> MemoryResult<Access<'_>> {
        if zone != ZoneId::User || space.is_active(self.mmu) {
            return Ok(Access {
                window: self.local,
                _alien: None,
            });
        }
        let guard = self.alien_lock.lock_irq();
        // SAFETY: the alien lock is held.
        unsafe { space.address_space().alienate(self.mmu)? };
        Ok(Access {
            window: self.alien,
            _alien: Some(guard),
        })
    }

    fn lock_zone<'s>(&'s self, space: &'s ProcessSpace, zone: ZoneId) -> MemoryResult<ZoneGuard<'s>> {
        self.zones.lock(zone, space.user_lock())
    }

    fn mapper(&self, window: SelfMapWindow) -> PageMapper<'a, M> {
        // SAFETY: callers hold the zone lock for every address they touch,
        // and the alien lock while using the alien window.
        unsafe { PageMapper::new(self.mmu, window, self.features) }
    }

    /// Retains every table frame a mapping created.
    fn adopt_tables(&self, tables: impl Iterator<Item = PhysicalPage<Size4K>>) {
        for frame in tables {
            hand_to_tables(self.frames, frame.base());
        }
    }

    /// Allocates and maps up to one batch of pages from `first` on.
    fn allocate_batch(
        &self,
        space: &ProcessSpace,
        zone: ZoneId,
        first: VirtualAddress,
        remaining: usize,
        flags: MemoryFlags,
        batch: &mut Batch,
    ) -> MemoryResult<()> {
        let access = self.access(space, zone)?;
        let _zone = self.lock_zone(space, zone)?;
        let mapper = self.mapper(access.window);

        for index in 0..remaining.min(BATCH_PAGES) {
            let va = first + index as u64 * PAGE_SIZE;
            let pa = self.frames.allocate(AllocationOptions::General)?;
            let mut new_tables = NewTables::new();
            let result = mapper.map(self.frames, va, pa, FrameSize::Size4K, flags, &mut new_tables);
            batch.record_map(new_tables);
            if let Err(e) = result {
                batch.stray = Some(pa);
                return Err(e);
            }
            self.mmu.invalidate_page(va);
            batch.push_frame(pa);
        }
        Ok(())
    }

    /// Hands the frames and tables of an allocation batch to the page tables
    /// and frees a frame that never got mapped.
    fn settle_allocated(&self, batch: &Batch) {
        self.adopt_tables(batch.tables());
        for &pa in batch.frames() {
            hand_to_tables(self.frames, pa);
        }
        if let Some(pa) = batch.stray
            && let Err(e) = self.frames.free(pa)
        {
            warn!("unmapped frame {pa} could not be freed: {e}");
        }
    }

    /// Unmaps `count` counted pages from `start` on and releases their frames.
    ///
    /// Keeps going after a failure and reports the first one.
    fn release_pages(
        &self,
        space: &ProcessSpace,
        zone: ZoneId,
        start: VirtualAddress,
        count: usize,
    ) -> MemoryResult<()> {
        let mut first_error = None;
        let mut done = 0;
        while done < count {
            let pages = (count - done).min(BATCH_PAGES);
            let mut batch = Batch::new();
            let unmapped = self.unmap_batch(space, zone, start + done as u64 * PAGE_SIZE, pages, &mut batch);

            for &pa in batch.frames() {
                // SAFETY: counted pages carry the reference their mapping took.
                let lease = unsafe { FrameLease::from_mapping(self.frames, pa) };
                if let Err(e) = lease.release() {
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = unmapped {
                first_error.get_or_insert(e);
            }
            done += pages;
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Unmaps and shoots down `pages` pages from `first` on, collecting their
    /// frames.
    fn unmap_batch(
        &self,
        space: &ProcessSpace,
        zone: ZoneId,
        first: VirtualAddress,
        pages: usize,
        batch: &mut Batch,
    ) -> MemoryResult<()> {
        let access = self.access(space, zone)?;
        let _zone = self.lock_zone(space, zone)?;
        let mapper = self.mapper(access.window);

        for index in 0..pages as u64 {
            let page = first + index * PAGE_SIZE;
            let unmapped = mapper.unmap(page)?;
            self.mmu.shootdown(page);
            batch.push_frame(unmapped.address);
        }
        Ok(())
    }

    /// Maps the next leaves of a [`MemoryManager::map_range`] call until the
    /// range or the batch is exhausted, advancing `offset`.
    #[allow(clippy::too_many_arguments)]
    fn map_range_batch(
        &self,
        space: &ProcessSpace,
        zone: ZoneId,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        offset: &mut u64,
        flags: MemoryFlags,
        batch: &mut Batch,
    ) -> MemoryResult<()> {
        let access = self.access(space, zone)?;
        let _zone = self.lock_zone(space, zone)?;
        let mapper = self.mapper(access.window);

        while *offset < len && !batch.is_full() {
            let (page, frame) = (va + *offset, pa + *offset);
            let size = if FrameSize::Size2M.is_aligned(page.as_u64())
                && FrameSize::Size2M.is_aligned(frame.as_u64())
                && len - *offset >= FrameSize::Size2M.bytes()
            {
                FrameSize::Size2M
            } else {
                FrameSize::Size4K
            };

            let mut new_tables = NewTables::new();
            let result = mapper.map(self.frames, page, frame, size, flags, &mut new_tables);
            batch.record_map(new_tables);
            result?;
            self.mmu.invalidate_page(page);
            *offset += size.bytes();
        }
        Ok(())
    }

    /// Unmaps every uncounted leaf in `[va, va + len)`, skipping holes.
    fn unmap_leaves(
        &self,
        space: &ProcessSpace,
        zone: ZoneId,
        va: VirtualAddress,
        len: u64,
    ) -> MemoryResult<()> {
        let access = self.access(space, zone)?;
        let _zone = self.lock_zone(space, zone)?;
        let mapper = self.mapper(access.window);

        let mut offset = 0;
        while offset < len {
            let page = va + offset;
            let Some(entry) = mapper.entry(page)? else {
                offset += PAGE_SIZE;
                continue;
            };
            mapper.unmap(page)?;
            self.mmu.shootdown(page);
            offset += entry.size.bytes();
        }
        Ok(())
    }
}

/// Hands one reference of the frame at `pa` to the page tables.
///
/// Frames outside every allocation space are not counted.
fn hand_to_tables(frames: &FrameAllocator, pa: PhysicalAddress) {
    if let Some(lease) = frames.retain(pa) {
        let _ = lease.into_mapping();
    }
}

/// The zone of the page-aligned address `va`.
fn page_zone(va: VirtualAddress) -> MemoryResult<ZoneId> {
    if !va.is_aligned::<Size4K>() {
        return Err(MemoryError::AlignmentFailure);
    }
    ZoneId::classify(va)
}

/// The zone holding all of `[va, va + len)`.
fn range_zone(va: VirtualAddress, len: u64) -> MemoryResult<ZoneId> {
    let zone = page_zone(va)?;
    let last = len
        .checked_sub(1)
        .and_then(|tail| va.checked_add(tail))
        .ok_or(MemoryError::ArgumentOutOfRange)?;
    if ZoneId::classify(last)? != zone {
        return Err(MemoryError::ArgumentOutOfRange);
    }
    Ok(zone)
}

fn byte_length(count: usize) -> MemoryResult<u64> {
    u64::try_from(count)
        .ok()
        .filter(|&count| count > 0)
        .and_then(|count| count.checked_mul(PAGE_SIZE))
        .ok_or(MemoryError::ArgumentOutOfRange)
}
