//! Low-level synchronization primitives.
//!
//! The cache and compaction code serialize many very short critical sections
//! (queue pops, extent list updates, modify-record reads). These primitives
//! keep such sections off the OS scheduler:
//! - [`Spinlock`] - test-and-set lock with backoff
//! - [`FairLock`] - ticket lock, FIFO among waiters
//! - [`RwSpinLock`] - reader/writer spin lock with writer preference
//! - [`CondVar`] - condition variable that remembers an unheard signal
//! - [`AtomicFlags`] - bit set with CAS-loop set/clear
//!
//! Anything that may block for a long time uses `parking_lot` instead.

mod condvar;
mod fair_lock;
mod flags;
mod rwlock;
mod spinlock;

pub use condvar::CondVar;
pub use fair_lock::{FairLock, FairLockGuard};
pub use flags::AtomicFlags;
pub use rwlock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spinlock::{Spinlock, SpinlockGuard};

/// Exponential spin, then yield to the scheduler.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    /// Wait a little longer than last time.
    pub(crate) fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}
