//! # Kernel Memory Configuration
//!
//! Compile-time configuration shared by the memory core: the virtual
//! address-space layout and the physical memory map handed over at boot.
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │ (unmapped, 2 MiB null guard)    │
//! USERLAND_START        ├─────────────────────────────────┤ 0x0000_0000_0020_0000
//!                       │ User space (one lock/process)   │
//! LOWER_HALF_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │ Non-canonical hole              │
//! ISA_DMA_START         ├─────────────────────────────────┤ 0xFFFF_8000_0000_0000
//!                       │ ISA DMA (16 MiB)                │
//! KERNEL_HEAP_START     ├─────────────────────────────────┤ 0xFFFF_8000_0100_0000
//!                       │ Kernel heap (shared)            │
//! CORE_HEAP_START       ├─────────────────────────────────┤ 0xFFFF_FDC0_0000_0000
//!                       │ Per-core heap arenas (64 × 4G)  │
//! VAS_DESCRIPTORS_START ├─────────────────────────────────┤ 0xFFFF_FE00_0000_0000
//!                       │ Address-space descriptors       │
//! HANDLE_TABLES_START   ├─────────────────────────────────┤ 0xFFFF_FE20_0000_0000
//!                       │ Handle tables                   │
//! KERNEL_MODULES_START  ├─────────────────────────────────┤ 0xFFFF_FE40_0000_0000
//!                       │ Kernel modules                  │
//! ALIEN_FRACTAL_START   ├─────────────────────────────────┤ 0xFFFF_FE80_0000_0000
//!                       │ Alien self-mapping window       │
//! LOCAL_FRACTAL_START   ├─────────────────────────────────┤ 0xFFFF_FF00_0000_0000
//!                       │ Local self-mapping window       │
//! KERNEL_BINARIES_START ├─────────────────────────────────┤ 0xFFFF_FF80_0000_0000
//!                       │ Kernel image, stacks            │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The two self-mapping windows are never valid targets for mapping calls;
//! their contents are the page tables themselves.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
