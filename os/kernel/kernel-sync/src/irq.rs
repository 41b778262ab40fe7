//! Interrupt masking for locks taken from exception context.
//!
//! A page fault or TLB shootdown handler may need a zone lock that the
//! interrupted code already holds on the same core. Taking such locks through
//! [`Mutex::lock_irq`] masks interrupts first, so the holder can never be
//! preempted by a handler spinning on it.

use crate::{Mutex, MutexGuard, RawLock};
use core::ops::{Deref, DerefMut};

/// Guard returned by [`Mutex::lock_irq`].
///
/// ```no_run
/// use kernel_sync::TicketMutex;
///
/// static CURSOR: TicketMutex<u64> = TicketMutex::new(0);
///
/// let mut cursor = CURSOR.lock_irq();
/// *cursor += 0x1000;
/// ```
pub struct IrqMutex<'a, T, R: RawLock> {
    // Fields drop in declaration order: unlock first, then restore IF.
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock> Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock> DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock> Mutex<T, R> {
    /// Masks interrupts, then locks. Both are undone when the guard drops.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let irq = IrqGuard::new();
        IrqMutex {
            guard: self.lock(),
            _irq: irq,
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    #[inline]
    pub fn cli() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn sti() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }
}

// Hosted builds run in ring 3 where `cli` faults; report interrupts as off.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn cli() {}

    #[inline]
    pub const fn sti() {}

    #[inline]
    pub const fn rflags() -> u64 {
        0
    }
}

const RFLAGS_IF: u64 = 1 << 9;

/// `cli`. Ring 0 only.
#[inline]
pub fn cli_stop_interrupts() {
    arch::cli();
}

/// `sti`. Ring 0 only.
#[inline]
pub fn sti_enable_interrupts() {
    arch::sti();
}

/// Current `RFLAGS`; always `0` in hosted builds.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    arch::rflags()
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}

/// Masks interrupts for its lifetime and restores the previous `IF` state.
///
/// Nested guards are fine: only the outermost one that found interrupts
/// enabled re-enables them.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            cli_stop_interrupts();
        }
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
