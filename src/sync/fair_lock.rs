//! Ticket-based fair lock.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use super::Backoff;

const WAITER_ONE: u32 = 1 << 16;

/// A ticket lock protecting `T`.
///
/// The lock word packs two 16-bit counters: the low half is the ticket now
/// being served, the high half the next ticket to hand out. Waiters are
/// served strictly in arrival order, so a thread re-taking the lock in a loop
/// (reconciliation) cannot starve a reader (compaction).
///
/// # Layout
/// ```text
/// bits 31..16   waiter  (next ticket)
/// bits 15..0    owner   (ticket being served)
/// ```
pub struct FairLock<T: ?Sized> {
    word: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the ticket protocol.
unsafe impl<T: ?Sized + Send> Send for FairLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for FairLock<T> {}

#[inline]
fn owner(word: u32) -> u16 {
    word as u16
}

#[inline]
fn waiter(word: u32) -> u16 {
    (word >> 16) as u16
}

impl<T> FairLock<T> {
    /// Create an unlocked fair lock.
    pub const fn new(data: T) -> Self {
        Self {
            word: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> FairLock<T> {
    /// Take a ticket and wait for it to be served.
    pub fn lock(&self) -> FairLockGuard<'_, T> {
        let ticket = waiter(self.word.fetch_add(WAITER_ONE, Ordering::Acquire));
        let mut backoff = Backoff::new();
        while owner(self.word.load(Ordering::Acquire)) != ticket {
            backoff.snooze();
        }
        FairLockGuard { lock: self }
    }

    /// Acquire only if nobody holds or waits for the lock.
    pub fn try_lock(&self) -> Option<FairLockGuard<'_, T>> {
        let cur = self.word.load(Ordering::Relaxed);
        if owner(cur) != waiter(cur) {
            return None;
        }
        self.word
            .compare_exchange(
                cur,
                cur.wrapping_add(WAITER_ONE),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| FairLockGuard { lock: self })
    }

    /// Whether the lock is held or contended (racy, for assertions).
    pub fn is_locked(&self) -> bool {
        let cur = self.word.load(Ordering::Relaxed);
        owner(cur) != waiter(cur)
    }

    fn unlock(&self) {
        // Waiters keep bumping the high half, so only the owner half may
        // change here and it must wrap without carrying.
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            let next = (cur & 0xFFFF_0000) | u32::from(owner(cur).wrapping_add(1));
            match self
                .word
                .compare_exchange_weak(cur, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

/// RAII guard; serves the next ticket on drop.
pub struct FairLockGuard<'a, T: ?Sized> {
    lock: &'a FairLock<T>,
}

impl<T: ?Sized> Deref for FairLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: holding the served ticket gives exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FairLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the served ticket gives exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for FairLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
