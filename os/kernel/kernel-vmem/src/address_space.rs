//! # Virtual Address Spaces
//!
//! An [`AddressSpace`] is one root table frame. It transitively owns every
//! table frame reachable from that root. All table access goes through a
//! self-mapping window:
//!
//! - the **local** window when the space is active on this core,
//! - the **alien** window otherwise, after [`AddressSpace::alienate`] pointed
//!   slot 509 of the active root at it.
//!
//! Kernel-half PML4 slots (256..=508 and 511) are pre-allocated once by
//! [`AddressSpace::bootstrap_kernel`] and copied into every new space, so a
//! kernel mapping made in any space is visible in all of them.
//!
//! [`PageMapper`] implements the per-page operations. It takes no locks: the
//! caller serializes access per zone.

use crate::FrameAlloc;
use crate::error::{IntegrityViolation, MemoryError, MemoryResult};
use crate::flags::{FrameSize, MemoryFlags, PagingFeatures};
use crate::mmu::Mmu;
use crate::page_table::{PageEntry, PageTable, TableIndex, TableLevel};
use crate::walker::{SelfMapWindow, WindowTables};
use core::fmt;
use kernel_info::memory::{ALIEN_FRACTAL_INDEX, KERNEL_PML4_FIRST, LOCAL_FRACTAL_INDEX};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::{info, trace};

/// PML4 slots shared by every address space.
fn kernel_slots() -> impl Iterator<Item = TableIndex> {
    (KERNEL_PML4_FIRST..ALIEN_FRACTAL_INDEX)
        .chain(core::iter::once(LOCAL_FRACTAL_INDEX + 1))
        .filter_map(TableIndex::new)
}

fn slot(index: u16) -> TableIndex {
    TableIndex::masked(u64::from(index))
}

/// The first address translated through PML4 slot `index`.
fn slot_base(index: TableIndex) -> VirtualAddress {
    VirtualAddress::from_sign_extended(u64::from(index.get()) << TableLevel::Pml4.shift())
}

/// One hardware address space, identified by its root table frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AddressSpace {
    root: PhysicalPage<Size4K>,
}

impl AddressSpace {
    /// Wraps an existing, self-mapped root.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self { root }
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Adopts the active root as the kernel address space.
    ///
    /// The loader leaves a root behind whose slot 510 maps itself. Every
    /// absent kernel-half PML4 slot gets an empty PDPT here; `on_table` is
    /// called for each new table frame.
    ///
    /// # Errors
    /// - Allocation failures from `alloc`.
    /// - [`IntegrityViolation::WindowUnresolved`] if the active root is not
    ///   self-mapped.
    pub fn bootstrap_kernel<M, A>(
        mmu: &M,
        alloc: &A,
        mut on_table: impl FnMut(PhysicalPage<Size4K>),
    ) -> MemoryResult<Self>
    where
        M: Mmu,
        A: FrameAlloc + ?Sized,
    {
        let space = Self::from_root(mmu.active_root());
        // SAFETY: the local window always shows the active hierarchy, and
        // bootstrap runs before any other core touches the tables.
        let tables = unsafe { WindowTables::new(mmu, SelfMapWindow::local()) };
        let root = tables.root()?;

        if root.entry(slot(LOCAL_FRACTAL_INDEX)).address() != space.root.base() {
            return Err(MemoryError::integrity(
                IntegrityViolation::WindowUnresolved(
                    SelfMapWindow::local().level_base(TableLevel::Pml4),
                ),
            ));
        }

        let mut created = 0usize;
        for index in kernel_slots() {
            if root.entry(index).present() {
                continue;
            }
            let frame = alloc.allocate_table_frame()?;
            root.set_entry(index, PageEntry::table(frame, false));
            let va = slot_base(index);
            mmu.invalidate_page(tables.window().table_address(TableLevel::Pdpt, va));
            tables.resolve(TableLevel::Pdpt, va)?.clear();
            on_table(frame);
            created += 1;
        }

        info!(
            "kernel address space at {}: {created} kernel PDPTs pre-allocated",
            space.root
        );
        Ok(space)
    }

    /// Builds a new address space with an empty user half.
    ///
    /// The new root is installed in the alien slot and stays there.
    ///
    /// # Errors
    /// Allocation failures from `alloc`, and window integrity failures.
    ///
    /// # Safety
    /// The caller must hold the lock serializing use of the alien slot, and
    /// the active root must be the kernel's or a space created from it.
    pub unsafe fn create<M, A>(mmu: &M, alloc: &A) -> MemoryResult<Self>
    where
        M: Mmu,
        A: FrameAlloc + ?Sized,
    {
        let frame = alloc.allocate_table_frame()?;
        let space = Self::from_root(frame);
        // SAFETY: forwarded from the caller.
        unsafe { space.alienate(mmu)? };

        // SAFETY: slot 509 now references the new root.
        let alien = unsafe { WindowTables::new(mmu, SelfMapWindow::alien()) };
        // SAFETY: the local window always shows the active hierarchy.
        let local = unsafe { WindowTables::new(mmu, SelfMapWindow::local()) };
        let root = alien.root()?;
        let active = local.root()?;

        root.clear();
        for index in kernel_slots() {
            root.set_entry(index, active.entry(index));
        }
        root.set_entry(slot(LOCAL_FRACTAL_INDEX), PageEntry::table(frame, false));

        info!("created address space at {frame}");
        Ok(space)
    }

    /// Returns `true` if this space is loaded on the executing core.
    #[must_use]
    pub fn is_active<M: Mmu>(&self, mmu: &M) -> bool {
        mmu.active_root() == self.root
    }

    /// Returns `true` if the active root's alien slot references this space.
    ///
    /// # Errors
    /// Window integrity failures.
    pub fn is_alien<M: Mmu>(&self, mmu: &M) -> MemoryResult<bool> {
        // SAFETY: read-only access through the local window.
        let local = unsafe { WindowTables::new(mmu, SelfMapWindow::local()) };
        let entry = local.root()?.entry(slot(ALIEN_FRACTAL_INDEX));
        Ok(entry.present() && entry.address() == self.root.base())
    }

    /// Loads this space on the executing core.
    ///
    /// # Safety
    /// See [`Mmu::activate`].
    pub unsafe fn activate<M: Mmu>(&self, mmu: &M) {
        trace!("activating address space {}", self.root);
        unsafe { mmu.activate(self.root) };
    }

    /// Points the active root's alien slot at this space.
    ///
    /// # Errors
    /// Window integrity failures.
    ///
    /// # Safety
    /// The caller must hold the lock serializing use of the alien slot.
    pub unsafe fn alienate<M: Mmu>(&self, mmu: &M) -> MemoryResult<()> {
        // SAFETY: the local window always shows the active hierarchy.
        let local = unsafe { WindowTables::new(mmu, SelfMapWindow::local()) };
        local
            .root()?
            .set_entry(slot(ALIEN_FRACTAL_INDEX), PageEntry::table(self.root, false));
        mmu.invalidate_page(SelfMapWindow::alien().level_base(TableLevel::Pml4));
        trace!("alien slot now references {}", self.root);
        Ok(())
    }
}

/// Table frames created by a single [`PageMapper::map`] call.
///
/// At most one per level below the root.
#[derive(Debug, Default, Clone)]
pub struct NewTables {
    frames: [Option<PhysicalPage<Size4K>>; 3],
}

impl NewTables {
    #[must_use]
    pub const fn new() -> Self {
        Self { frames: [None; 3] }
    }

    fn push(&mut self, frame: PhysicalPage<Size4K>) {
        if let Some(slot) = self.frames.iter_mut().find(|f| f.is_none()) {
            *slot = Some(frame);
        } else {
            debug_assert!(false, "more than three tables created for one mapping");
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysicalPage<Size4K>> + '_ {
        self.frames.iter().flatten().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames[0].is_none()
    }
}

/// What a removed leaf mapped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Unmapped {
    pub address: PhysicalAddress,
    pub size: FrameSize,
}

/// A present leaf, decoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappedEntry {
    pub address: PhysicalAddress,
    pub size: FrameSize,
    pub flags: MemoryFlags,
    pub accessed: bool,
    pub dirty: bool,
}

struct Leaf<'m> {
    table: &'m PageTable,
    index: TableIndex,
    level: TableLevel,
    entry: PageEntry,
}

impl Leaf<'_> {
    fn size(&self) -> FrameSize {
        FrameSize::from_leaf_level(self.level).unwrap_or(FrameSize::Size4K)
    }
}

/// Per-page operations on the hierarchy behind one window.
pub struct PageMapper<'m, M: Mmu> {
    tables: WindowTables<'m, M>,
    features: PagingFeatures,
}

impl<'m, M: Mmu> PageMapper<'m, M> {
    /// # Safety
    /// See [`WindowTables::new`].
    #[must_use]
    pub const unsafe fn new(mmu: &'m M, window: SelfMapWindow, features: PagingFeatures) -> Self {
        Self {
            // SAFETY: forwarded from the caller.
            tables: unsafe { WindowTables::new(mmu, window) },
            features,
        }
    }

    #[must_use]
    pub const fn window(&self) -> SelfMapWindow {
        self.tables.window()
    }

    /// Maps `va` to `pa` with a single leaf of `size`.
    ///
    /// Missing intermediate tables are allocated from `alloc`, installed and
    /// then cleared through the window; their frames are added to
    /// `new_tables`. Lower-half paths get the userland bit on every level.
    ///
    /// # Errors
    /// - [`MemoryError::UnsupportedOperation`] for 1 GiB leaves.
    /// - [`MemoryError::AlignmentFailure`] if `va` or `pa` is not aligned to `size`.
    /// - [`MemoryError::PageMapped`] if a leaf already covers `va`.
    /// - Allocation failures from `alloc`.
    pub fn map<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: FrameSize,
        flags: MemoryFlags,
        new_tables: &mut NewTables,
    ) -> MemoryResult<()> {
        if size == FrameSize::Size1G {
            return Err(MemoryError::UnsupportedOperation);
        }
        if !size.is_aligned(va.as_u64()) || !size.is_aligned(pa.as_u64()) {
            return Err(MemoryError::AlignmentFailure);
        }

        let leaf_level = size.leaf_level();
        let userland = va.is_lower_half();
        let mut table = self.tables.root()?;
        let mut level = TableLevel::Pml4;

        while let Some(lower) = level.lower().filter(|_| level != leaf_level) {
            let index = level.index_of(va);
            let entry = table.entry(index);
            if entry.present() {
                if entry.is_leaf_at(level) {
                    return Err(MemoryError::PageMapped);
                }
                table = self.tables.resolve(lower, va)?;
            } else {
                let frame = alloc.allocate_table_frame()?;
                table.set_entry(index, PageEntry::table(frame, userland));
                new_tables.push(frame);
                self.tables
                    .mmu()
                    .invalidate_page(self.window().table_address(lower, va));
                table = self.tables.resolve(lower, va)?;
                table.clear();
                trace!("new {} at {frame} for {va}", lower.name());
            }
            level = lower;
        }

        let index = level.index_of(va);
        if table.entry(index).present() {
            return Err(MemoryError::PageMapped);
        }
        table.set_entry(index, PageEntry::leaf(pa, level, flags, self.features));
        Ok(())
    }

    /// Removes the leaf mapping `va`.
    ///
    /// The TLB is left alone; the caller invalidates. Tables that become
    /// empty are kept.
    ///
    /// # Errors
    /// - [`IntegrityViolation::UnmapUnmapped`] if nothing maps `va`.
    /// - [`MemoryError::AlignmentFailure`] if `va` is not the leaf's base.
    pub fn unmap(&self, va: VirtualAddress) -> MemoryResult<Unmapped> {
        let Some(leaf) = self.find_leaf(va)? else {
            return Err(MemoryError::integrity(IntegrityViolation::UnmapUnmapped(va)));
        };
        let size = leaf.size();
        if !size.is_aligned(va.as_u64()) {
            return Err(MemoryError::AlignmentFailure);
        }
        leaf.table.set_entry(leaf.index, PageEntry::new());
        Ok(Unmapped {
            address: leaf.entry.leaf_address(leaf.level),
            size,
        })
    }

    /// Decodes the leaf mapping `va`, if any.
    ///
    /// # Errors
    /// Window integrity failures.
    pub fn entry(&self, va: VirtualAddress) -> MemoryResult<Option<MappedEntry>> {
        Ok(self.find_leaf(va)?.map(|leaf| MappedEntry {
            address: leaf.entry.leaf_address(leaf.level),
            size: leaf.size(),
            flags: leaf.entry.memory_flags(self.features),
            accessed: leaf.entry.accessed(),
            dirty: leaf.entry.dirty(),
        }))
    }

    /// The permissions of the page containing `va`.
    ///
    /// # Errors
    /// [`MemoryError::PageNotMapped`] if nothing maps `va`.
    pub fn page_flags(&self, va: VirtualAddress) -> MemoryResult<MemoryFlags> {
        self.find_leaf(va)?
            .map(|leaf| leaf.entry.memory_flags(self.features))
            .ok_or(MemoryError::PageNotMapped)
    }

    /// Rewrites the permissions of the page containing `va` in one store.
    ///
    /// # Errors
    /// [`MemoryError::PageNotMapped`] if nothing maps `va`.
    pub fn set_page_flags(&self, va: VirtualAddress, flags: MemoryFlags) -> MemoryResult<()> {
        let leaf = self.find_leaf(va)?.ok_or(MemoryError::PageNotMapped)?;
        leaf.table.set_entry(
            leaf.index,
            leaf.entry.with_memory_flags(flags, self.features),
        );
        Ok(())
    }

    /// The physical address `va` translates to.
    ///
    /// # Errors
    /// Window integrity failures.
    pub fn translate(&self, va: VirtualAddress) -> MemoryResult<Option<PhysicalAddress>> {
        Ok(self.find_leaf(va)?.map(|leaf| {
            let offset = va.as_u64() & (leaf.level.coverage() - 1);
            leaf.entry.leaf_address(leaf.level) + offset
        }))
    }

    /// The table of `level` holding the entry for `va`, ready for printing.
    ///
    /// Returns `Ok(None)` if the path to that table does not exist.
    ///
    /// # Errors
    /// Window integrity failures.
    pub fn dump_level(
        &self,
        va: VirtualAddress,
        level: TableLevel,
    ) -> MemoryResult<Option<TableDump<'m>>> {
        Ok(self
            .tables
            .table(level, va)?
            .map(|table| TableDump { table, level, va }))
    }

    fn find_leaf(&self, va: VirtualAddress) -> MemoryResult<Option<Leaf<'m>>> {
        let mut table = self.tables.root()?;
        for level in TableLevel::TOP_DOWN {
            let index = level.index_of(va);
            let entry = table.entry(index);
            if !entry.present() {
                return Ok(None);
            }
            if entry.is_leaf_at(level) {
                return Ok(Some(Leaf {
                    table,
                    index,
                    level,
                    entry,
                }));
            }
            match self.tables.child(table, level, va)? {
                Some(child) => table = child,
                None => return Ok(None),
            }
        }
        Ok(None)
    }
}

/// A read-only view of one table, printed one present entry per line.
pub struct TableDump<'m> {
    table: &'m PageTable,
    level: TableLevel,
    va: VirtualAddress,
}

impl TableDump<'_> {
    #[must_use]
    pub const fn level(&self) -> TableLevel {
        self.level
    }

    /// Number of present entries.
    #[must_use]
    pub fn present(&self) -> usize {
        self.table.present_entries().count()
    }
}

impl fmt::Display for TableDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} containing {}:", self.level.name(), self.va)?;
        for (index, entry) in self.table.present_entries() {
            let kind = if entry.is_leaf_at(self.level) {
                "page"
            } else {
                "table"
            };
            writeln!(
                f,
                "  [{:3}] {kind:5} {} {}{}{}{}{}",
                index.get(),
                entry.address(),
                if entry.writable() { 'W' } else { '-' },
                if entry.userland() { 'U' } else { '-' },
                if entry.global() { 'G' } else { '-' },
                if entry.no_execute() { '-' } else { 'X' },
                if entry.accessed() { 'A' } else { '-' },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::SoftMmu;
    use std::sync::Mutex;

    /// Hands out frames from a range of simulated memory, never reusing them.
    struct BumpAlloc {
        next: Mutex<u64>,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: Mutex::new(start),
                end,
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn allocate_table_frame(&self) -> MemoryResult<PhysicalPage<Size4K>> {
            let mut next = self.next.lock().unwrap();
            if *next + 0x1000 > self.end {
                return Err(MemoryError::OutOfMemory);
            }
            let frame = PhysicalPage::from_addr(PhysicalAddress::new(*next));
            *next += 0x1000;
            Ok(frame)
        }
    }

    const BASE: u64 = 0x10_0000;

    fn boot(frames: usize) -> (SoftMmu, BumpAlloc, AddressSpace) {
        let mmu = SoftMmu::new(PhysicalAddress::new(BASE), frames);
        let alloc = BumpAlloc::new(BASE, BASE + frames as u64 * 0x1000);
        mmu.bootstrap_root(alloc.allocate_table_frame().unwrap())
            .unwrap();
        let kernel = AddressSpace::bootstrap_kernel(&mmu, &alloc, |_| {}).unwrap();
        (mmu, alloc, kernel)
    }

    fn local(mmu: &SoftMmu) -> PageMapper<'_, SoftMmu> {
        unsafe { PageMapper::new(mmu, SelfMapWindow::local(), PagingFeatures::baseline()) }
    }

    #[test]
    fn bootstrap_preallocates_kernel_slots() {
        let mmu = SoftMmu::new(PhysicalAddress::new(BASE), 512);
        let alloc = BumpAlloc::new(BASE, BASE + 512 * 0x1000);
        mmu.bootstrap_root(alloc.allocate_table_frame().unwrap())
            .unwrap();
        let mut tables = 0;
        let kernel = AddressSpace::bootstrap_kernel(&mmu, &alloc, |_| tables += 1).unwrap();
        assert_eq!(tables, 254);
        assert!(kernel.is_active(&mmu));

        let root = mmu.frame(kernel.root().base()).unwrap();
        assert!(root.entry(slot(256)).present());
        assert!(root.entry(slot(508)).present());
        assert!(root.entry(slot(511)).present());
        assert!(!root.entry(slot(509)).present());
        assert!(!root.entry(slot(255)).present());
    }

    #[test]
    fn map_creates_tables_and_leaf() {
        let (mmu, alloc, _) = boot(512);
        let mapper = local(&mmu);
        let va = VirtualAddress::new(0x1000_0000);
        let pa = PhysicalAddress::new(0x2000);

        let mut new_tables = NewTables::new();
        mapper
            .map(&alloc, va, pa, FrameSize::Size4K, MemoryFlags::WRITABLE, &mut new_tables)
            .unwrap();
        assert_eq!(new_tables.len(), 3);

        assert_eq!(mmu.translate(va + 0x123), Some(pa + 0x123));
        let entry = mapper.entry(va).unwrap().unwrap();
        assert_eq!(entry.address, pa);
        assert_eq!(entry.size, FrameSize::Size4K);
        assert_eq!(entry.flags, MemoryFlags::WRITABLE);

        // User paths carry the userland bit on the intermediate levels.
        let pd = mapper.tables.table(TableLevel::Pd, va).unwrap().unwrap();
        assert!(pd.entry(TableLevel::Pd.index_of(va)).userland());
    }

    #[test]
    fn second_map_reuses_tables() {
        let (mmu, alloc, _) = boot(512);
        let mapper = local(&mmu);
        let mut first = NewTables::new();
        let mut second = NewTables::new();
        let va = VirtualAddress::new(0xFFFF_8000_0100_0000);
        mapper
            .map(&alloc, va, PhysicalAddress::new(0x5000), FrameSize::Size4K, MemoryFlags::GLOBAL, &mut first)
            .unwrap();
        mapper
            .map(&alloc, va + 0x1000, PhysicalAddress::new(0x6000), FrameSize::Size4K, MemoryFlags::GLOBAL, &mut second)
            .unwrap();
        // Kernel PDPT exists already: PD and PT only.
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
    }

    #[test]
    fn map_rejects_present_and_misaligned() {
        let (mmu, alloc, _) = boot(512);
        let mapper = local(&mmu);
        let mut t = NewTables::new();
        let va = VirtualAddress::new(0x40_0000);
        mapper
            .map(&alloc, va, PhysicalAddress::new(0x20_0000), FrameSize::Size2M, MemoryFlags::empty(), &mut t)
            .unwrap();

        let mut t = NewTables::new();
        assert_eq!(
            mapper.map(&alloc, va + 0x1000, PhysicalAddress::new(0x1000), FrameSize::Size4K, MemoryFlags::empty(), &mut t),
            Err(MemoryError::PageMapped)
        );
        assert_eq!(
            mapper.map(&alloc, va, PhysicalAddress::new(0x1000), FrameSize::Size2M, MemoryFlags::empty(), &mut t),
            Err(MemoryError::AlignmentFailure)
        );
        assert_eq!(
            mapper.map(&alloc, VirtualAddress::new(0x4000_0000), PhysicalAddress::new(0), FrameSize::Size1G, MemoryFlags::empty(), &mut t),
            Err(MemoryError::UnsupportedOperation)
        );
        assert!(t.is_empty());
    }

    #[test]
    fn unmap_returns_frame_and_clears_leaf() {
        let (mmu, alloc, _) = boot(512);
        let mapper = local(&mmu);
        let va = VirtualAddress::new(0x20_0000);
        let mut t = NewTables::new();
        mapper
            .map(&alloc, va, PhysicalAddress::new(0x40_0000), FrameSize::Size2M, MemoryFlags::WRITABLE, &mut t)
            .unwrap();
        assert_eq!(
            mapper.translate(va + 0x1234).unwrap(),
            Some(PhysicalAddress::new(0x40_1234))
        );

        let unmapped = mapper.unmap(va).unwrap();
        assert_eq!(unmapped.address, PhysicalAddress::new(0x40_0000));
        assert_eq!(unmapped.size, FrameSize::Size2M);
        assert_eq!(mapper.entry(va).unwrap(), None);
        assert_eq!(mapper.page_flags(va), Err(MemoryError::PageNotMapped));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "unmapping unmapped page"))]
    fn unmapping_twice_is_an_integrity_failure() {
        let (mmu, alloc, _) = boot(512);
        let mapper = local(&mmu);
        let va = VirtualAddress::new(0x30_0000);
        let mut t = NewTables::new();
        mapper
            .map(&alloc, va, PhysicalAddress::new(0x3000), FrameSize::Size4K, MemoryFlags::empty(), &mut t)
            .unwrap();
        mapper.unmap(va).unwrap();
        let err = mapper.unmap(va).unwrap_err();
        assert_eq!(
            err,
            MemoryError::IntegrityFailure(IntegrityViolation::UnmapUnmapped(va))
        );
    }

    #[test]
    fn set_page_flags_rewrites_permissions() {
        let (mmu, alloc, _) = boot(512);
        let mapper = local(&mmu);
        let va = VirtualAddress::new(0x1000_0000);
        let mut t = NewTables::new();
        mapper
            .map(&alloc, va, PhysicalAddress::new(0x2000), FrameSize::Size4K, MemoryFlags::WRITABLE, &mut t)
            .unwrap();
        mapper
            .set_page_flags(va, MemoryFlags::WRITABLE | MemoryFlags::EXECUTABLE)
            .unwrap();
        assert_eq!(
            mapper.page_flags(va).unwrap(),
            MemoryFlags::WRITABLE | MemoryFlags::EXECUTABLE
        );
        assert_eq!(mmu.translate(va), Some(PhysicalAddress::new(0x2000)));
    }

    #[test]
    fn created_space_is_edited_through_alien_window() {
        let (mmu, alloc, kernel) = boot(1024);
        let user = unsafe { AddressSpace::create(&mmu, &alloc) }.unwrap();
        assert!(user.is_alien(&mmu).unwrap());
        assert!(!user.is_active(&mmu));

        let alien =
            unsafe { PageMapper::new(&mmu, SelfMapWindow::alien(), PagingFeatures::baseline()) };
        let va = VirtualAddress::new(0x40_0000);
        let mut t = NewTables::new();
        alien
            .map(&alloc, va, PhysicalAddress::new(0x9000), FrameSize::Size4K, MemoryFlags::USERLAND, &mut t)
            .unwrap();

        // Invisible in the active space, visible in the new one.
        assert_eq!(mmu.translate(va), None);
        assert_eq!(
            mmu.translate_in(user.root(), va),
            Some(PhysicalAddress::new(0x9000))
        );

        // Kernel half is shared.
        let kva = VirtualAddress::new(0xFFFF_8000_0200_0000);
        local(&mmu)
            .map(&alloc, kva, PhysicalAddress::new(0xA000), FrameSize::Size4K, MemoryFlags::empty(), &mut NewTables::new())
            .unwrap();
        unsafe { user.activate(&mmu) };
        assert_eq!(mmu.translate(kva), Some(PhysicalAddress::new(0xA000)));
        assert_eq!(mmu.translate(va), Some(PhysicalAddress::new(0x9000)));
        assert_eq!(local(&mmu).translate(va).unwrap(), Some(PhysicalAddress::new(0x9000)));
        unsafe { kernel.activate(&mmu) };
    }

    #[test]
    fn dump_lists_present_entries() {
        let (mmu, alloc, _) = boot(512);
        let mapper = local(&mmu);
        let va = VirtualAddress::new(0x1000_0000);
        let mut t = NewTables::new();
        mapper
            .map(&alloc, va, PhysicalAddress::new(0x2000), FrameSize::Size4K, MemoryFlags::WRITABLE, &mut t)
            .unwrap();
        let dump = mapper.dump_level(va, TableLevel::Pt).unwrap().unwrap();
        assert_eq!(dump.present(), 1);
        let text = dump.to_string();
        assert!(text.starts_with("PT containing"));
        assert!(text.contains("[  0] page"));

        assert!(
            mapper
                .dump_level(VirtualAddress::new(0x7000_0000_0000), TableLevel::Pt)
                .unwrap()
                .is_none()
        );
    }
}
