use crate::error::{MemoryError, MemoryResult};
use crate::mmu::Mmu;
use crate::page_table::{PageEntry, PageTable, TableLevel};
use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_info::memory::LOCAL_FRACTAL_INDEX;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// A simulated MMU over a block of simulated physical memory.
///
/// Physical memory is a contiguous run of 4 KiB frames starting at `base`.
/// Every frame is stored as a [`PageTable`], so page tables written through a
/// window land in the same atomics the software walker reads. Data pages are
/// never touched by the memory core and simply stay zero.
///
/// Window addresses are resolved by walking the active hierarchy in software,
/// which exercises the self-mapping arithmetic exactly as the CPU would.
pub struct SoftMmu {
    base: PhysicalAddress,
    frames: Box<[PageTable]>,
    root: AtomicU64,
    invalidations: AtomicUsize,
    shootdowns: AtomicUsize,
}

impl SoftMmu {
    /// Simulated memory of `frame_count` zeroed frames starting at `base`.
    #[must_use]
    pub fn new(base: PhysicalAddress, frame_count: usize) -> Self {
        debug_assert!(base.is_aligned::<Size4K>());
        Self {
            base,
            frames: (0..frame_count).map(|_| PageTable::zeroed()).collect(),
            root: AtomicU64::new(0),
            invalidations: AtomicUsize::new(0),
            shootdowns: AtomicUsize::new(0),
        }
    }

    /// First simulated physical address.
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// End (exclusive) of simulated physical memory.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.base + (self.frames.len() as u64) * 0x1000
    }

    /// The simulated frame at `pa`, if it is inside simulated memory.
    #[must_use]
    pub fn frame(&self, pa: PhysicalAddress) -> Option<&PageTable> {
        let offset = pa.as_u64().checked_sub(self.base.as_u64())?;
        let index = usize::try_from(offset >> 12).ok()?;
        self.frames.get(index)
    }

    /// Turns `frame` into a self-mapped, empty root and activates it.
    ///
    /// This is what the loader leaves behind before the kernel runs.
    ///
    /// # Errors
    /// [`MemoryError::ArgumentOutOfRange`] if `frame` lies outside simulated
    /// memory.
    pub fn bootstrap_root(&self, frame: PhysicalPage<Size4K>) -> MemoryResult<()> {
        let table = self
            .frame(frame.base())
            .ok_or(MemoryError::ArgumentOutOfRange)?;
        table.clear();
        table.set_entry(
            TableLevel::Pml4.index_of(VirtualAddress::new(
                u64::from(LOCAL_FRACTAL_INDEX) << TableLevel::Pml4.shift(),
            )),
            PageEntry::table(frame, false),
        );
        self.root.store(frame.base().as_u64(), Ordering::Release);
        Ok(())
    }

    /// Translates `va` through the active hierarchy.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate_in(self.active_root(), va)
    }

    /// Translates `va` through the hierarchy rooted at `root`.
    #[must_use]
    pub fn translate_in(
        &self,
        root: PhysicalPage<Size4K>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let mut table = self.frame(root.base())?;
        for level in TableLevel::TOP_DOWN {
            let entry = table.entry(level.index_of(va));
            if !entry.present() {
                return None;
            }
            if entry.is_leaf_at(level) {
                let offset = va.as_u64() & (level.coverage() - 1);
                return Some(entry.leaf_address(level) + offset);
            }
            table = self.frame(entry.address())?;
        }
        None
    }

    /// Number of local TLB invalidations requested so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Number of shootdowns requested so far.
    #[must_use]
    pub fn shootdowns(&self) -> usize {
        self.shootdowns.load(Ordering::Relaxed)
    }
}

unsafe impl Mmu for SoftMmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.root.load(Ordering::Acquire)))
    }

    unsafe fn activate(&self, root: PhysicalPage<Size4K>) {
        self.root.store(root.base().as_u64(), Ordering::Release);
    }

    fn invalidate_page(&self, _va: VirtualAddress) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn shootdown(&self, va: VirtualAddress) {
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
        self.invalidate_page(va);
    }

    fn resolve_table(&self, window_address: VirtualAddress) -> Option<NonNull<PageTable>> {
        let pa = self.translate(window_address)?;
        if !pa.is_aligned::<Size4K>() {
            return None;
        }
        self.frame(pa).map(NonNull::from)
    }
}
