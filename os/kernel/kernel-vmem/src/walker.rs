//! # Self-Mapping Windows
//!
//! Every root table maps itself in PML4 slot 510. Walking through that slot
//! makes the hierarchy appear as ordinary memory inside a 512 GiB window: each
//! extra pass through slot 510 strips one level off the translation, so the
//! tables of every level show up at a fixed offset.
//!
//! For a window whose fractal slot is `F`:
//!
//! ```text
//! L1 (PT)   = sx(F<<39)
//! L2 (PD)   = L1 + 510<<30
//! L3 (PDPT) = L2 + 510<<21
//! L4 (PML4) = local L3 + F<<12
//! ```
//!
//! and the table holding the level-`L` entry for `va` lives at
//! `base(L) + ((va >> 9·L) & mask(L))`.
//!
//! The local window (`F = 510`) shows the active hierarchy. The alien window
//! (`F = 509`) shows whatever root the active root's slot 509 points to. The
//! alien root itself is reached through the local window's slot 509, so it is
//! addressable before its own self-map is written.
//!
//! [`WindowTables`] is the only code that turns window addresses into table
//! references.

use crate::error::{IntegrityViolation, MemoryError, MemoryResult};
use crate::mmu::Mmu;
use crate::page_table::{PageTable, TableLevel};
use kernel_info::memory::{ALIEN_FRACTAL_INDEX, LOCAL_FRACTAL_INDEX};
use kernel_memory_addresses::VirtualAddress;

/// Address arithmetic of one self-mapping window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SelfMapWindow {
    slot: u16,
}

impl SelfMapWindow {
    /// The window onto the active hierarchy.
    #[must_use]
    pub const fn local() -> Self {
        Self {
            slot: LOCAL_FRACTAL_INDEX,
        }
    }

    /// The window onto the hierarchy installed in slot 509.
    #[must_use]
    pub const fn alien() -> Self {
        Self {
            slot: ALIEN_FRACTAL_INDEX,
        }
    }

    /// The PML4 slot this window goes through.
    #[must_use]
    pub const fn slot(&self) -> u16 {
        self.slot
    }

    #[must_use]
    pub const fn is_alien(&self) -> bool {
        self.slot != LOCAL_FRACTAL_INDEX
    }

    /// Base address of the tables of `level` inside this window.
    #[must_use]
    pub const fn level_base(&self, level: TableLevel) -> VirtualAddress {
        const SELF: u64 = LOCAL_FRACTAL_INDEX as u64;
        let slot = self.slot as u64;
        let bits = match level {
            TableLevel::Pt => slot << 39,
            TableLevel::Pd => (slot << 39) | (SELF << 30),
            TableLevel::Pdpt => (slot << 39) | (SELF << 30) | (SELF << 21),
            TableLevel::Pml4 => (SELF << 39) | (SELF << 30) | (SELF << 21) | (slot << 12),
        };
        VirtualAddress::from_sign_extended(bits)
    }

    /// Window address of the level-`level` table translating `va`.
    #[must_use]
    pub const fn table_address(&self, level: TableLevel, va: VirtualAddress) -> VirtualAddress {
        let depth = level.depth();
        let mask = ((1u64 << (48 - 9 * depth)) - 1) & !0xFFF;
        let offset = (va.as_u64() >> (9 * depth)) & mask;
        VirtualAddress::new(self.level_base(level).as_u64() + offset)
    }
}

/// Checked table access through one window.
///
/// Each accessor verifies the parent entry is present and not a leaf before
/// resolving the child, so no reference to an unmapped window page is ever
/// formed.
pub struct WindowTables<'m, M: Mmu> {
    mmu: &'m M,
    window: SelfMapWindow,
}

impl<'m, M: Mmu> WindowTables<'m, M> {
    /// # Safety
    /// The active root must reach the intended hierarchy through `window`
    /// (for the alien window: slot 509 must reference it), and the caller must
    /// serialize mutation of the tables it touches.
    #[must_use]
    pub const unsafe fn new(mmu: &'m M, window: SelfMapWindow) -> Self {
        Self { mmu, window }
    }

    #[must_use]
    pub const fn window(&self) -> SelfMapWindow {
        self.window
    }

    #[must_use]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }

    /// The root table of the hierarchy behind this window.
    ///
    /// # Errors
    /// [`IntegrityViolation::WindowUnresolved`] if the self-map is broken.
    pub fn root(&self) -> MemoryResult<&'m PageTable> {
        self.resolve(TableLevel::Pml4, VirtualAddress::zero())
    }

    /// The table one level below `parent` on the path to `va`.
    ///
    /// Returns `Ok(None)` if the parent entry is absent or maps a large page.
    ///
    /// # Errors
    /// [`IntegrityViolation::WindowUnresolved`] if a present parent does not
    /// resolve.
    pub fn child(
        &self,
        parent: &PageTable,
        parent_level: TableLevel,
        va: VirtualAddress,
    ) -> MemoryResult<Option<&'m PageTable>> {
        let Some(level) = parent_level.lower() else {
            return Ok(None);
        };
        let entry = parent.entry(parent_level.index_of(va));
        if !entry.present() || entry.is_leaf_at(parent_level) {
            return Ok(None);
        }
        self.resolve(level, va).map(Some)
    }

    /// The table of `level` on the path to `va`, walking down from the root.
    ///
    /// # Errors
    /// See [`WindowTables::child`].
    pub fn table(
        &self,
        level: TableLevel,
        va: VirtualAddress,
    ) -> MemoryResult<Option<&'m PageTable>> {
        let mut table = self.root()?;
        let mut current = TableLevel::Pml4;
        while current != level {
            match self.child(table, current, va)? {
                Some(child) => table = child,
                None => return Ok(None),
            }
            match current.lower() {
                Some(lower) => current = lower,
                None => return Ok(None),
            }
        }
        Ok(Some(table))
    }

    /// Resolves the table of `level` for `va` without checking its parent.
    ///
    /// Used right after the parent entry was installed.
    pub(crate) fn resolve(
        &self,
        level: TableLevel,
        va: VirtualAddress,
    ) -> MemoryResult<&'m PageTable> {
        let address = self.window.table_address(level, va);
        if self.window.is_alien() {
            // Another root may have been behind slot 509 the last time.
            self.mmu.invalidate_page(address);
        }
        match self.mmu.resolve_table(address) {
            // SAFETY: `Mmu::resolve_table` only hands out live table frames.
            Some(table) => Ok(unsafe { table.as_ref() }),
            None => Err(MemoryError::integrity(
                IntegrityViolation::WindowUnresolved(address),
            )),
        }
    }
}
