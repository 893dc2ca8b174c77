//! Atomic bit set.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A set of flag bits updated with compare-and-swap loops.
///
/// Used for the cache pass flags and the per-Ref queued bit, where several
/// threads flip independent bits of the same word.
#[derive(Default)]
pub struct AtomicFlags(AtomicU32);

impl AtomicFlags {
    pub const fn new(bits: u32) -> Self {
        Self(AtomicU32::new(bits))
    }

    /// Set `bits`. Returns the previous value.
    pub fn set(&self, bits: u32) -> u32 {
        self.update(|cur| cur | bits)
    }

    /// Clear `bits`. Returns the previous value.
    pub fn clear(&self, bits: u32) -> u32 {
        self.update(|cur| cur & !bits)
    }

    /// Set `bits` only if none of them are set. Returns whether this call
    /// set them.
    pub fn try_set(&self, bits: u32) -> bool {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            if cur & bits != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                cur,
                cur | bits,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// All of `bits` are set.
    #[inline]
    pub fn contains(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits == bits
    }

    /// Any of `bits` is set.
    #[inline]
    pub fn intersects(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits != 0
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    fn update(&self, f: impl Fn(u32) -> u32) -> u32 {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            match self
                .0
                .compare_exchange_weak(cur, f(cur), Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(prev) => return prev,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl fmt::Debug for AtomicFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicFlags({:#x})", self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_and_clear() {
        let flags = AtomicFlags::new(0);
        assert_eq!(flags.set(0b101), 0);
        assert!(flags.contains(0b101));
        assert!(flags.intersects(0b100));
        assert!(!flags.contains(0b111));

        assert_eq!(flags.clear(0b001), 0b101);
        assert_eq!(flags.bits(), 0b100);
    }

    #[test]
    fn test_try_set_is_exclusive() {
        let flags = AtomicFlags::new(0);
        assert!(flags.try_set(0b10));
        assert!(!flags.try_set(0b10));
        flags.clear(0b10);
        assert!(flags.try_set(0b10));
    }

    #[test]
    fn test_concurrent_independent_bits() {
        let flags = Arc::new(AtomicFlags::new(0));
        let mut handles = vec![];

        for bit in 0..16u32 {
            let flags = Arc::clone(&flags);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    flags.set(1 << bit);
                    flags.clear(1 << bit);
                }
                flags.set(1 << bit);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(flags.bits(), 0xFFFF);
    }
}
