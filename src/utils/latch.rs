use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A settable wakeup flag. Waiters sleep until the latch is set or the
/// timeout expires; `reset` must be called before re-checking the condition
/// the latch guards.
#[derive(Debug, Default)]
pub struct Latch {
    is_set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut guard = self.is_set.lock();
        *guard = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.is_set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.is_set.lock()
    }

    /// Returns true when woken by `set`, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.is_set.lock();
        if *guard {
            return true;
        }
        let _ = self.cond.wait_for(&mut guard, timeout);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_times_out_when_unset() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn set_wakes_waiter() {
        let latch = Arc::new(Latch::new());
        let waker = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.set();
        });
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
        latch.reset();
        assert!(!latch.is_set());
    }
}
