use crate::RawLock;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// FIFO ticket lock with contention counters.
///
/// Waiters are served strictly in the order they drew their ticket, so no
/// core starves behind others hammering the same zone.
#[derive(Default)]
pub struct RawTicket {
    next: AtomicUsize,
    owner: AtomicUsize,
    acquisitions: AtomicUsize,
    contended: AtomicUsize,
}

/// Snapshot of a [`RawTicket`]'s counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LockStats {
    /// Total number of successful acquisitions.
    pub acquisitions: usize,
    /// Acquisitions that found the lock held and had to wait.
    pub contended: usize,
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            contended: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

// SAFETY: tickets are unique, and only the holder of ticket `owner` proceeds.
unsafe impl RawLock for RawTicket {
    #[inline]
    fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        if self.owner.load(Ordering::Acquire) != ticket {
            self.contended.fetch_add(1, Ordering::Relaxed);
            while self.owner.load(Ordering::Acquire) != ticket {
                spin_loop();
            }
        }
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let owner = self.owner.load(Ordering::Relaxed);
        let claimed = self
            .next
            .compare_exchange(owner, owner + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if claimed {
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.owner.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn unlock(&self) {
        // Only the holder writes `owner`.
        let served = self.owner.load(Ordering::Relaxed);
        self.owner.store(served + 1, Ordering::Release);
    }
}
