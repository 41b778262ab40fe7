use crate::RawLock;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-set spin lock; unfair but cheap.
///
/// Used where critical sections are a handful of instructions and never
/// nest, such as the per-space frame stacks.
#[derive(Default)]
pub struct RawSpin {
    held: AtomicBool,
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }
}

// SAFETY: `swap(true)` succeeds for exactly one caller until `unlock`.
unsafe impl RawLock for RawSpin {
    #[inline]
    fn lock(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            // Spin on a plain load to keep the cache line shared.
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}
