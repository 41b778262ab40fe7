use crate::mmu::Mmu;
use crate::page_table::PageTable;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// CR3 bits \[51:12\]; PWT, PCD and the PCID field are masked off.
const CR3_ROOT_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// The bare-metal MMU of the executing core.
pub struct X86Mmu {
    _private: (),
}

impl X86Mmu {
    /// # Safety
    /// Must only be constructed in ring 0 on an x86-64 CPU running with
    /// 4-level paging and a self-mapped root.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

unsafe impl Mmu for X86Mmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalPage::from_addr(PhysicalAddress::new(cr3 & CR3_ROOT_MASK))
    }

    unsafe fn activate(&self, root: PhysicalPage<Size4K>) {
        let cr3 = root.base().as_u64();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn resolve_table(&self, window_address: VirtualAddress) -> Option<NonNull<PageTable>> {
        NonNull::new(window_address.as_mut_ptr::<PageTable>())
    }
}
