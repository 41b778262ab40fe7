//! # Kernel synchronization primitives
//!
//! Exclusive locks for the memory core. Two raw lock flavours plug into one
//! [`Mutex`]:
//!
//! - [`RawTicket`]: FIFO ticket lock. Waiters are served in arrival order,
//!   which gives starvation freedom. It also counts contended acquisitions so
//!   callers can verify that unrelated locks never interfere.
//! - [`RawSpin`]: test-and-set lock for very short critical sections where
//!   fairness does not matter.
//!
//! Code that may run inside exception handlers takes locks through
//! [`Mutex::lock_irq`], which keeps interrupts disabled for the lifetime of
//! the guard.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod raw_ticket;

pub use irq::{IrqGuard, IrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::{LockStats, RawTicket};

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }

    /// Acquisition statistics of the underlying ticket lock.
    #[inline]
    pub fn stats(&self) -> LockStats {
        self.raw().stats()
    }
}

/// A lock without data, the building block of [`Mutex`].
///
/// # Safety
/// After `lock` returns or `try_lock` returns `true`, no other caller may
/// acquire the lock until `unlock` is called.
pub unsafe trait RawLock {
    fn lock(&self);
    fn try_lock(&self) -> bool;

    /// Returns `true` while a holder or a waiter exists.
    fn is_locked(&self) -> bool;

    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn unlock(&self);
}
