//! # Kernel Memory Management
//!
//! Physical frame ownership and the kernel memory context, built on the page
//! tables of [`kernel_vmem`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Memory Manager                      │
//! │    • map / unmap / flags / translate per page       │
//! │    • page allocation from zone cursors, rollback    │
//! │    • process spaces, alien window                   │
//! └───────────┬─────────────────────────┬───────────────┘
//!             │                         │
//! ┌───────────▼─────────────┐ ┌─────────▼───────────────┐
//! │  Zone Lock Partition    │ │  Frame Allocator        │
//! │  • one lock per zone    │ │  • frame stack per space│
//! │  • two-tier heap lock   │ │  • reference counting   │
//! │  • bump cursors         │ │  • reservations, caching│
//! └─────────────────────────┘ └─────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Frame Allocator ([`frame_alloc`])
//!
//! One [`FrameAllocationSpace`] per usable physical range, each a stack of
//! free frame indices with a descriptor per frame. The stack and descriptors
//! live in control pages carved from the start of the range. Frames mapped in
//! page tables are reference counted through [`FrameLease`].
//!
//! ### Zone Lock Partition ([`zones`])
//!
//! The kernel half is split into zones at 1 GiB boundaries, each with its own
//! ticket lock and bump cursor. The heap has a master lock and one sub-lock
//! per core arena.
//!
//! ### Memory Manager ([`manager`])
//!
//! [`MemoryManager`] is constructed once at boot and passed by reference. Its
//! operations take exactly the locks their address needs:
//!
//! ```text
//! alien lock (inactive user spaces only) → zone lock → frame-space lock
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns [`MemoryResult`]. Corruption of allocator or page
//! table state is reported as [`MemoryError::IntegrityFailure`], which also
//! panics in debug builds.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod manager;
pub mod process;
pub mod zones;

pub use crate::frame_alloc::{
    AllocationOptions, FrameAllocationSpace, FrameAllocator, FrameDescriptor, FrameLease,
    FrameStats, FrameStatus, MAX_SPACES,
};
pub use crate::manager::MemoryManager;
pub use crate::process::ProcessSpace;
pub use crate::zones::{BumpCursor, HeapLock, ZoneGuard, ZoneId, ZonePartition};
pub use kernel_vmem::{IntegrityViolation, MapOptions, MemoryError, MemoryFlags, MemoryResult};
