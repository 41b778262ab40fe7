//! # Process Address Spaces
//!
//! [`ProcessSpace`] is the identity the memory manager operates on: one
//! hardware address space plus the lock and cursor of its user half. The
//! kernel half of every space is shared and locked through the zone
//! partition instead.

use crate::zones::BumpCursor;
use kernel_info::memory::{LOWER_HALF_END, USERLAND_START};
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::{LockStats, TicketMutex};
use kernel_vmem::{AddressSpace, Mmu};

/// One address space and its user-zone lock.
pub struct ProcessSpace {
    vas: AddressSpace,
    user: TicketMutex<BumpCursor>,
}

impl ProcessSpace {
    #[must_use]
    pub const fn new(vas: AddressSpace) -> Self {
        Self {
            vas,
            user: TicketMutex::new(BumpCursor::new(USERLAND_START, LOWER_HALF_END - 1)),
        }
    }

    #[must_use]
    pub const fn address_space(&self) -> AddressSpace {
        self.vas
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.vas.root()
    }

    /// Returns `true` if this space is loaded on the executing core.
    #[must_use]
    pub fn is_active<M: Mmu>(&self, mmu: &M) -> bool {
        self.vas.is_active(mmu)
    }

    /// The lock serializing the user half.
    pub(crate) const fn user_lock(&self) -> &TicketMutex<BumpCursor> {
        &self.user
    }

    /// Contention counters of the user-half lock.
    #[must_use]
    pub fn lock_stats(&self) -> LockStats {
        self.user.stats()
    }
}

impl core::fmt::Debug for ProcessSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessSpace")
            .field("root", &self.vas.root())
            .finish_non_exhaustive()
    }
}
