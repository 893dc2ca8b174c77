//! Condition variable with a remembered signal.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct CondState {
    generation: u64,
    waiters: u32,
    /// A signal arrived while nobody was waiting.
    pending: bool,
}

/// A condition variable used to park eviction workers and throttled
/// application threads.
///
/// A signal sent while no thread is waiting is kept and consumed by the next
/// `wait`, so a wakeup issued just before a worker goes to sleep is not lost.
/// Waits always carry a timeout; callers re-check their predicate either way.
#[derive(Debug)]
pub struct CondVar {
    name: &'static str,
    state: Mutex<CondState>,
    cond: Condvar,
}

impl CondVar {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(CondState::default()),
            cond: Condvar::new(),
        }
    }

    /// Wake every waiter, or remember the signal if there are none.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        if state.waiters == 0 {
            state.pending = true;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Block until signalled or until `timeout` elapses.
    ///
    /// Returns `true` if woken by a signal.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.pending {
            state.pending = false;
            return true;
        }

        let generation = state.generation;
        let deadline = Instant::now() + timeout;
        state.waiters += 1;
        let signalled = loop {
            if state.generation != generation {
                break true;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break state.generation != generation;
            }
        };
        state.waiters -= 1;
        signalled
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let cond = CondVar::new("test");
        let start = Instant::now();
        assert!(!cond.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_without_waiter_is_remembered() {
        let cond = CondVar::new("test");
        cond.signal();
        assert!(cond.wait(Duration::from_secs(5)));
        // Consumed by the first wait.
        assert!(!cond.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let cond = Arc::new(CondVar::new("test"));
        let waiter = {
            let cond = Arc::clone(&cond);
            thread::spawn(move || cond.wait(Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        cond.signal();
        assert!(waiter.join().unwrap());
    }
}
