//! # Physical and Virtual Address Types
//!
//! Zero-cost wrappers that keep physical frames and virtual pages apart at the
//! type level. Everything in the memory core speaks these types: the frame
//! allocator hands out [`PhysicalPage<Size4K>`] values, the page-table walker
//! consumes [`VirtualAddress`] values, and the memory manager converts between
//! the two only through page-table lookups.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory or MMIO space. |
//! | [`VirtualAddress`] | A byte address translated by the page tables. |
//! | [`PhysicalPage<S>`] | An `S`-aligned physical frame base. |
//! | [`VirtualPage<S>`] | An `S`-aligned virtual page base. |
//!
//! ## Page Sizes
//!
//! The x86-64 leaf sizes are modelled as marker types implementing
//! [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages, the base granularity.
//! - [`Size2M`]: 2 MiB pages, terminating the walk at the page directory.
//! - [`Size1G`]: 1 GiB pages, terminating the walk at the PDPT.
//!
//! ## Canonical Addresses
//!
//! With 4-level paging, bits 63..48 of a virtual address must replicate bit 47.
//! [`VirtualAddress::is_canonical`] checks this, and
//! [`VirtualAddress::from_sign_extended`] builds canonical addresses from the
//! 48 meaningful bits, which is how the self-mapping windows compute their
//! table addresses.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8000_0012_3456);
//! assert!(va.is_canonical());
//! assert_eq!(va.page::<Size4K>().base().as_u64(), 0xFFFF_8000_0012_3000);
//! assert_eq!(va.offset::<Size4K>(), 0x456);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`, the number of low bits used for the in-page offset.
    const SHIFT: u32;
    /// Human readable name used in diagnostics.
    const NAME: &'static str;

    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;
}

/// 4 KiB page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;

/// 2 MiB page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;

/// 1 GiB page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;

impl sealed::Sealed for Size4K {}
impl sealed::Sealed for Size2M {}
impl sealed::Sealed for Size1G {}

impl PageSize for Size4K {
    const SIZE: u64 = 0x1000;
    const SHIFT: u32 = 12;
    const NAME: &'static str = "4K";
}

impl PageSize for Size2M {
    const SIZE: u64 = 0x20_0000;
    const SHIFT: u32 = 21;
    const NAME: &'static str = "2M";
}

impl PageSize for Size1G {
    const SIZE: u64 = 0x4000_0000;
    const SHIFT: u32 = 30;
    const NAME: &'static str = "1G";
}

/// Number of implemented virtual address bits under 4-level paging.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;

/// A physical byte address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A virtual byte address.
///
/// Canonicality is not enforced on construction; callers that accept
/// addresses from the outside check [`VirtualAddress::is_canonical`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

macro_rules! address_common {
    ($ty:ident, $page:ident) => {
        impl $ty {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Returns `true` if the address is a multiple of `S::SIZE`.
            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.0 & S::OFFSET_MASK == 0
            }

            /// Rounds down to the containing `S` boundary.
            #[inline]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(self.0 & !S::OFFSET_MASK)
            }

            /// Rounds up to the next `S` boundary, or `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn align_up<S: PageSize>(self) -> Option<Self> {
                match self.0.checked_add(S::OFFSET_MASK) {
                    Some(v) => Some(Self(v & !S::OFFSET_MASK)),
                    None => None,
                }
            }

            /// The page of size `S` containing this address.
            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page::containing(self)
            }

            /// The offset of this address inside its `S` page.
            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> u64 {
                self.0 & S::OFFSET_MASK
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, bytes: u64) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({:#018x})"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl Add<u64> for $ty {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $ty {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl From<u64> for $ty {
            #[inline]
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$ty> for u64 {
            #[inline]
            fn from(value: $ty) -> Self {
                value.0
            }
        }
    };
}

address_common!(PhysicalAddress, PhysicalPage);
address_common!(VirtualAddress, VirtualPage);

impl VirtualAddress {
    /// Builds a canonical address from its low 48 bits by replicating bit 47.
    #[inline]
    #[must_use]
    pub const fn from_sign_extended(bits: u64) -> Self {
        let shift = 64 - VIRTUAL_ADDRESS_BITS;
        Self((((bits << shift).cast_signed()) >> shift).cast_unsigned())
    }

    /// Returns `true` if bits 63..48 replicate bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        Self::from_sign_extended(self.0).0 == self.0
    }

    /// Returns `true` for canonical addresses in the lower (user) half.
    #[inline]
    #[must_use]
    pub const fn is_lower_half(self) -> bool {
        self.0 < (1 << (VIRTUAL_ADDRESS_BITS - 1))
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

macro_rules! page_common {
    ($page:ident, $addr:ident) => {
        impl<S: PageSize> $page<S> {
            /// Wraps an `S`-aligned address.
            ///
            /// ### Debug assertions
            /// - Asserts that `addr` is aligned to `S`.
            #[inline]
            #[must_use]
            pub const fn from_addr(addr: $addr) -> Self {
                debug_assert!(addr.is_aligned::<S>(), "page base must be aligned");
                Self {
                    base: addr,
                    _size: PhantomData,
                }
            }

            /// Wraps `addr` if it is aligned to `S`.
            #[inline]
            #[must_use]
            pub const fn try_from_addr(addr: $addr) -> Option<Self> {
                if addr.is_aligned::<S>() {
                    Some(Self::from_addr(addr))
                } else {
                    None
                }
            }

            /// The page containing `addr`.
            #[inline]
            #[must_use]
            pub const fn containing(addr: $addr) -> Self {
                Self::from_addr(addr.align_down::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                self.base
            }

            /// The address `offset` bytes into this page.
            #[inline]
            #[must_use]
            pub const fn join(self, offset: u64) -> $addr {
                debug_assert!(offset < S::SIZE);
                $addr::new(self.base.as_u64() + offset)
            }

            /// The page `count` pages after this one, or `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn checked_add_pages(self, count: u64) -> Option<Self> {
                match count.checked_mul(S::SIZE) {
                    Some(bytes) => match self.base.checked_add(bytes) {
                        Some(base) => Some(Self::from_addr(base)),
                        None => None,
                    },
                    None => None,
                }
            }
        }

        impl<S: PageSize> fmt::Debug for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    concat!(stringify!($page), "<{}>({:#018x})"),
                    S::NAME,
                    self.base.as_u64()
                )
            }
        }

        impl<S: PageSize> fmt::Display for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}/{}", self.base.as_u64(), S::NAME)
            }
        }

        impl<S: PageSize> From<$page<S>> for $addr {
            #[inline]
            fn from(page: $page<S>) -> Self {
                page.base
            }
        }
    };
}

/// An `S`-aligned physical frame.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: PhysicalAddress,
    _size: PhantomData<S>,
}

/// An `S`-aligned virtual page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: VirtualAddress,
    _size: PhantomData<S>,
}

page_common!(PhysicalPage, PhysicalAddress);
page_common!(VirtualPage, VirtualAddress);
