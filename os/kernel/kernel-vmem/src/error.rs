//! # Memory Errors
//!
//! One error type flows through the whole memory core: the frame allocator,
//! the address-space operations and the memory manager all return
//! [`MemoryError`], so an allocator failure deep inside a table walk reaches
//! the caller unchanged.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Result alias used across the memory core.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    /// No physical frame is available.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The target page is already mapped, or a frame is not in the expected state.
    #[error("page is already mapped")]
    PageMapped,
    /// The target page is not mapped.
    #[error("page is not mapped")]
    PageNotMapped,
    /// Address or size lies outside the region the caller may govern.
    #[error("argument outside the governed range")]
    ArgumentOutOfRange,
    /// Address or size is not aligned to the requested granularity.
    #[error("address or size is not aligned")]
    AlignmentFailure,
    /// The request is valid but not implemented for this configuration.
    #[error("operation not supported")]
    UnsupportedOperation,
    /// A runtime invariant was violated.
    #[error("integrity failure: {0}")]
    IntegrityFailure(IntegrityViolation),
}

/// The invariant an [`MemoryError::IntegrityFailure`] reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("double free of frame {0}")]
    DoubleFree(PhysicalAddress),
    #[error("freeing reserved frame {0}")]
    FreeReserved(PhysicalAddress),
    #[error("unmapping unmapped page {0}")]
    UnmapUnmapped(VirtualAddress),
    #[error("reference count underflow on frame {0}")]
    ReferenceUnderflow(PhysicalAddress),
    #[error("frame stack corrupted at slot {0}")]
    CorruptStack(usize),
    #[error("self-mapping window does not resolve {0}")]
    WindowUnresolved(VirtualAddress),
}

impl MemoryError {
    /// Reports a violated invariant.
    ///
    /// Debug builds halt here with the diagnostic; release builds log it and
    /// hand the error back to the caller.
    #[track_caller]
    #[must_use]
    pub fn integrity(violation: IntegrityViolation) -> Self {
        log::error!("integrity failure: {violation}");
        if cfg!(debug_assertions) {
            panic!("integrity failure: {violation}");
        }
        Self::IntegrityFailure(violation)
    }
}
