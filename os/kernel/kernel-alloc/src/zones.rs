//! # Zone Lock Partition
//!
//! The kernel half is cut into zones along 1 GiB boundaries. Every zone has its
//! own lock and bump cursor, so mapping work in one zone never waits for
//! another. Since the kernel PDPTs are pre-allocated, two zones never create
//! the same page directory or page table.
//!
//! The kernel heap uses two tiers: one master lock for the shared part and a
//! sub-lock per core arena. A master operation drains every arena before it
//! proceeds; arena operations on different cores run in parallel.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::{
    CORE_HEAP_ARENA_SIZE, CORE_HEAP_START, FRACTAL_END, HANDLE_TABLES_END, HANDLE_TABLES_START,
    HIGHER_HALF_START, KERNEL_BINARIES_LAST, KERNEL_BINARIES_START, KERNEL_HEAP_END,
    KERNEL_HEAP_START, KERNEL_MODULES_END, KERNEL_MODULES_START, LOWER_HALF_END, MAX_CORES,
    USERLAND_START, VAS_DESCRIPTORS_END, VAS_DESCRIPTORS_START,
};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{IrqGuard, IrqMutex, LockStats, RawLock, RawTicket, TicketMutex};
use kernel_vmem::{MemoryError, MemoryResult};
use log::warn;

/// One independently locked region of virtual memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ZoneId {
    /// The per-process lower half.
    User,
    /// The shared kernel heap, including the ISA DMA window.
    KernelHeap,
    /// The heap arena of one core.
    CoreHeap(usize),
    VasDescriptors,
    HandleTables,
    KernelModules,
    /// Kernel image, stacks and loader leftovers in the last PML4 slot.
    KernelBinaries,
}

impl ZoneId {
    /// The zone `va` belongs to.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for non-canonical addresses and for
    /// the self-mapping windows.
    pub fn classify(va: VirtualAddress) -> MemoryResult<Self> {
        let va = va.as_u64();
        let zone = match va {
            _ if va < LOWER_HALF_END => Self::User,
            _ if va < HIGHER_HALF_START => return Err(MemoryError::ArgumentOutOfRange),
            _ if va < CORE_HEAP_START => Self::KernelHeap,
            _ if va < KERNEL_HEAP_END => {
                Self::CoreHeap(((va - CORE_HEAP_START) / CORE_HEAP_ARENA_SIZE) as usize)
            }
            _ if va < VAS_DESCRIPTORS_END => Self::VasDescriptors,
            _ if va < HANDLE_TABLES_END => Self::HandleTables,
            _ if va < KERNEL_MODULES_END => Self::KernelModules,
            _ if va < FRACTAL_END => return Err(MemoryError::ArgumentOutOfRange),
            _ => Self::KernelBinaries,
        };
        Ok(zone)
    }

    /// First and last address of the zone's allocation range.
    ///
    /// The kernel heap range starts after the ISA DMA window, which is only
    /// mapped explicitly.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for a core index past [`MAX_CORES`].
    pub fn cursor_range(self) -> MemoryResult<(u64, u64)> {
        let range = match self {
            Self::User => (USERLAND_START, LOWER_HALF_END - 1),
            Self::KernelHeap => (KERNEL_HEAP_START, CORE_HEAP_START - 1),
            Self::CoreHeap(core) if core < MAX_CORES => {
                let start = CORE_HEAP_START + core as u64 * CORE_HEAP_ARENA_SIZE;
                (start, start + CORE_HEAP_ARENA_SIZE - 1)
            }
            Self::CoreHeap(_) => return Err(MemoryError::ArgumentOutOfRange),
            Self::VasDescriptors => (VAS_DESCRIPTORS_START, VAS_DESCRIPTORS_END - 1),
            Self::HandleTables => (HANDLE_TABLES_START, HANDLE_TABLES_END - 1),
            Self::KernelModules => (KERNEL_MODULES_START, KERNEL_MODULES_END - 1),
            Self::KernelBinaries => (KERNEL_BINARIES_START, KERNEL_BINARIES_LAST),
        };
        Ok(range)
    }
}

/// Hands out consecutive addresses inside a zone.
#[derive(Debug, Clone)]
pub struct BumpCursor {
    start: u64,
    last: u64,
    offset: u64,
}

impl BumpCursor {
    /// A cursor over `[start, last]`.
    #[must_use]
    pub const fn new(start: u64, last: u64) -> Self {
        Self {
            start,
            last,
            offset: 0,
        }
    }

    /// A cursor over the allocation range of `zone`.
    ///
    /// # Errors
    /// See [`ZoneId::cursor_range`].
    pub fn for_zone(zone: ZoneId) -> MemoryResult<Self> {
        let (start, last) = zone.cursor_range()?;
        Ok(Self::new(start, last))
    }

    /// Number of addresses covered.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.last - self.start + 1
    }

    /// The address the next allocation starts at.
    #[must_use]
    pub const fn peek(&self) -> VirtualAddress {
        VirtualAddress::new(self.start + self.offset)
    }

    /// Reserves `bytes` of address space.
    ///
    /// An allocation that would run past the zone end wraps to the start. The
    /// wrapped range is not checked; a collision shows up as
    /// [`MemoryError::PageMapped`] when mapping.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for zero or more than the zone size.
    pub fn advance(&mut self, bytes: u64) -> MemoryResult<VirtualAddress> {
        if bytes == 0 || bytes > self.size() {
            return Err(MemoryError::ArgumentOutOfRange);
        }
        if bytes > self.size() - self.offset {
            warn!(
                "address cursor wrapped at {:#018x}, reusing {:#018x}",
                self.start + self.offset,
                self.start
            );
            self.offset = 0;
        }
        let va = self.peek();
        self.offset += bytes;
        Ok(va)
    }
}

/// Two-tier lock of the kernel heap.
pub struct HeapLock {
    master: RawTicket,
    master_held: AtomicBool,
    cores: [RawTicket; MAX_CORES],
    master_cursor: UnsafeCell<BumpCursor>,
    core_cursors: [UnsafeCell<BumpCursor>; MAX_CORES],
}

// SAFETY: every cursor is only reached through a guard holding its lock.
unsafe impl Sync for HeapLock {}

impl HeapLock {
    #[must_use]
    pub fn new() -> Self {
        let (start, last) = (KERNEL_HEAP_START, CORE_HEAP_START - 1);
        Self {
            master: RawTicket::new(),
            master_held: AtomicBool::new(false),
            cores: [const { RawTicket::new() }; MAX_CORES],
            master_cursor: UnsafeCell::new(BumpCursor::new(start, last)),
            core_cursors: core::array::from_fn(|core| {
                let start = CORE_HEAP_START + core as u64 * CORE_HEAP_ARENA_SIZE;
                UnsafeCell::new(BumpCursor::new(start, start + CORE_HEAP_ARENA_SIZE - 1))
            }),
        }
    }

    /// Takes the master lock and drains every core arena.
    pub fn lock_master(&self) -> HeapMasterGuard<'_> {
        let irq = IrqGuard::new();
        self.master.lock();
        self.master_held.store(true, Ordering::SeqCst);
        for core in &self.cores {
            core.lock();
        }
        HeapMasterGuard { lock: self, _irq: irq }
    }

    /// Takes the sub-lock of one core arena.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for a core index past [`MAX_CORES`].
    pub fn lock_core(&self, core: usize) -> MemoryResult<CoreHeapGuard<'_>> {
        let sub = self.cores.get(core).ok_or(MemoryError::ArgumentOutOfRange)?;
        let irq = IrqGuard::new();
        loop {
            while self.master_held.load(Ordering::SeqCst) {
                spin_loop();
            }
            sub.lock();
            if !self.master_held.load(Ordering::SeqCst) {
                break;
            }
            // The master arrived in between; let it drain us.
            // SAFETY: taken just above.
            unsafe { sub.unlock() };
        }
        Ok(CoreHeapGuard {
            lock: self,
            core,
            _irq: irq,
        })
    }

    #[must_use]
    pub fn master_stats(&self) -> LockStats {
        self.master.stats()
    }

    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for a core index past [`MAX_CORES`].
    pub fn core_stats(&self, core: usize) -> MemoryResult<LockStats> {
        self.cores
            .get(core)
            .map(RawTicket::stats)
            .ok_or(MemoryError::ArgumentOutOfRange)
    }

    /// Returns `true` while a master operation holds or drains the heap.
    #[must_use]
    pub fn is_master_held(&self) -> bool {
        self.master_held.load(Ordering::SeqCst)
    }
}

impl Default for HeapLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the shared kernel heap.
pub struct HeapMasterGuard<'a> {
    lock: &'a HeapLock,
    _irq: IrqGuard,
}

impl Deref for HeapMasterGuard<'_> {
    type Target = BumpCursor;

    fn deref(&self) -> &BumpCursor {
        // SAFETY: the master lock is held.
        unsafe { &*self.lock.master_cursor.get() }
    }
}

impl DerefMut for HeapMasterGuard<'_> {
    fn deref_mut(&mut self) -> &mut BumpCursor {
        // SAFETY: the master lock is held.
        unsafe { &mut *self.lock.master_cursor.get() }
    }
}

impl Drop for HeapMasterGuard<'_> {
    fn drop(&mut self) {
        for core in self.lock.cores.iter().rev() {
            // SAFETY: all sub-locks were taken in `lock_master`.
            unsafe { core.unlock() };
        }
        self.lock.master_held.store(false, Ordering::SeqCst);
        // SAFETY: taken in `lock_master`.
        unsafe { self.lock.master.unlock() };
    }
}

/// Exclusive access to one core's heap arena.
pub struct CoreHeapGuard<'a> {
    lock: &'a HeapLock,
    core: usize,
    _irq: IrqGuard,
}

impl Deref for CoreHeapGuard<'_> {
    type Target = BumpCursor;

    fn deref(&self) -> &BumpCursor {
        // SAFETY: the core's sub-lock is held.
        unsafe { &*self.lock.core_cursors[self.core].get() }
    }
}

impl DerefMut for CoreHeapGuard<'_> {
    fn deref_mut(&mut self) -> &mut BumpCursor {
        // SAFETY: the core's sub-lock is held.
        unsafe { &mut *self.lock.core_cursors[self.core].get() }
    }
}

impl Drop for CoreHeapGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: taken in `lock_core`.
        unsafe { self.lock.cores[self.core].unlock() };
    }
}

/// A held zone lock, giving access to the zone's cursor.
pub enum ZoneGuard<'a> {
    Ticket(IrqMutex<'a, BumpCursor, RawTicket>),
    HeapMaster(HeapMasterGuard<'a>),
    CoreHeap(CoreHeapGuard<'a>),
}

impl Deref for ZoneGuard<'_> {
    type Target = BumpCursor;

    fn deref(&self) -> &BumpCursor {
        match self {
            Self::Ticket(guard) => guard,
            Self::HeapMaster(guard) => guard,
            Self::CoreHeap(guard) => guard,
        }
    }
}

impl DerefMut for ZoneGuard<'_> {
    fn deref_mut(&mut self) -> &mut BumpCursor {
        match self {
            Self::Ticket(guard) => guard,
            Self::HeapMaster(guard) => guard,
            Self::CoreHeap(guard) => guard,
        }
    }
}

/// The locks of every kernel zone.
///
/// The user zone's lock lives in each `ProcessSpace` and is passed in.
pub struct ZonePartition {
    heap: HeapLock,
    vas_descriptors: TicketMutex<BumpCursor>,
    handle_tables: TicketMutex<BumpCursor>,
    kernel_modules: TicketMutex<BumpCursor>,
    kernel_binaries: TicketMutex<BumpCursor>,
}

impl Default for ZonePartition {
    fn default() -> Self {
        Self::new()
    }
}

impl ZonePartition {
    #[must_use]
    pub fn new() -> Self {
        let ticket =
            |start: u64, last: u64| TicketMutex::new(BumpCursor::new(start, last));
        Self {
            heap: HeapLock::new(),
            vas_descriptors: ticket(VAS_DESCRIPTORS_START, VAS_DESCRIPTORS_END - 1),
            handle_tables: ticket(HANDLE_TABLES_START, HANDLE_TABLES_END - 1),
            kernel_modules: ticket(KERNEL_MODULES_START, KERNEL_MODULES_END - 1),
            kernel_binaries: ticket(KERNEL_BINARIES_START, KERNEL_BINARIES_LAST),
        }
    }

    #[must_use]
    pub const fn heap(&self) -> &HeapLock {
        &self.heap
    }

    /// Takes the lock of `zone` with interrupts disabled.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for a core index past [`MAX_CORES`].
    pub fn lock<'a>(
        &'a self,
        zone: ZoneId,
        user: &'a TicketMutex<BumpCursor>,
    ) -> MemoryResult<ZoneGuard<'a>> {
        let guard = match zone {
            ZoneId::KernelHeap => ZoneGuard::HeapMaster(self.heap.lock_master()),
            ZoneId::CoreHeap(core) => ZoneGuard::CoreHeap(self.heap.lock_core(core)?),
            _ => ZoneGuard::Ticket(self.ticket(zone, user).lock_irq()),
        };
        Ok(guard)
    }

    /// Contention counters of the lock guarding `zone`.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] for a core index past [`MAX_CORES`].
    pub fn stats(&self, zone: ZoneId, user: &TicketMutex<BumpCursor>) -> MemoryResult<LockStats> {
        match zone {
            ZoneId::KernelHeap => Ok(self.heap.master_stats()),
            ZoneId::CoreHeap(core) => self.heap.core_stats(core),
            _ => Ok(self.ticket(zone, user).stats()),
        }
    }

    fn ticket<'a>(
        &'a self,
        zone: ZoneId,
        user: &'a TicketMutex<BumpCursor>,
    ) -> &'a TicketMutex<BumpCursor> {
        match zone {
            ZoneId::VasDescriptors => &self.vas_descriptors,
            ZoneId::HandleTables => &self.handle_tables,
            ZoneId::KernelModules => &self.kernel_modules,
            ZoneId::KernelBinaries => &self.kernel_binaries,
            ZoneId::User | ZoneId::KernelHeap | ZoneId::CoreHeap(_) => user,
        }
    }
}
