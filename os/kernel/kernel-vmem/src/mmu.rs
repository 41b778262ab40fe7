//! # MMU Access
//!
//! The seam between the paging code and the processor. Everything the memory
//! core needs from the hardware goes through [`Mmu`]: the active root, TLB
//! maintenance, and turning a self-mapping window address into a table
//! reference.
//!
//! - [`X86Mmu`] talks to the real CPU (`mov cr3`, `invlpg`); window addresses
//!   are dereferenced directly.
//! - [`SoftMmu`] (tests and the `soft-mmu` feature) simulates physical memory
//!   and resolves window addresses with a software page walk, exactly as the
//!   hardware would.

#[cfg(any(test, feature = "soft-mmu"))]
mod soft;
#[cfg(target_arch = "x86_64")]
mod x86;

#[cfg(any(test, feature = "soft-mmu"))]
pub use soft::SoftMmu;
#[cfg(target_arch = "x86_64")]
pub use x86::X86Mmu;

use crate::page_table::PageTable;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Hardware paging operations.
///
/// # Safety
/// Implementors must guarantee that [`Mmu::resolve_table`] only returns
/// pointers to 4 KiB frames that the active hierarchy actually reaches through
/// the given address, and that those frames stay valid for the lifetime of
/// the implementor.
pub unsafe trait Mmu: Sync {
    /// The root table frame currently loaded on this core.
    fn active_root(&self) -> PhysicalPage<Size4K>;

    /// Switches this core to the hierarchy rooted at `root`.
    ///
    /// # Safety
    /// `root` must hold a valid PML4 whose kernel half maps the running code,
    /// and whose slot 510 references `root` itself.
    unsafe fn activate(&self, root: PhysicalPage<Size4K>);

    /// Drops the TLB entry for `va` on this core.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drops the TLB entry for `va` on every core that may cache it.
    ///
    /// Defaults to a local invalidation; multiprocessor kernels override this
    /// with an IPI-based protocol.
    fn shootdown(&self, va: VirtualAddress) {
        self.invalidate_page(va);
    }

    /// Resolves a self-mapping window address to the table frame behind it.
    ///
    /// Returns `None` if the address does not translate.
    fn resolve_table(&self, window_address: VirtualAddress) -> Option<NonNull<PageTable>>;
}
