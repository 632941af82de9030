//! One-shot latches.
//!
//! `Latch` is a signal-all condition a session blocks on exactly once
//! (differencing-done, all-done). `CountdownLatch` gates the snapshot
//! pre-phase and is cancellable: `drain()` releases waiters regardless of
//! the remaining count, so `terminate()` can unblock a session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A one-shot, signal-all latch. Waiters released by `signal_all` stay
/// released forever; signaling twice is a no-op.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    pub fn new() -> Latch {
        Latch {
            inner: Arc::new(LatchInner { signaled: Mutex::new(false), condvar: Condvar::new() }),
        }
    }

    pub fn signal_all(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Block until signaled.
    pub fn wait(&self) {
        let mut signaled = self.inner.signaled.lock();
        while !*signaled {
            self.inner.condvar.wait(&mut signaled);
        }
    }

    /// Block until signaled or the timeout elapses. Returns whether the
    /// latch was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.inner.signaled.lock();
        if *signaled {
            return true;
        }
        self.inner.condvar.wait_for(&mut signaled, timeout);
        *signaled
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellable countdown latch.
#[derive(Clone)]
pub struct CountdownLatch {
    inner: Arc<CountdownInner>,
}

struct CountdownInner {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl CountdownLatch {
    pub fn new(count: usize) -> CountdownLatch {
        CountdownLatch {
            inner: Arc::new(CountdownInner { count: Mutex::new(count), condvar: Condvar::new() }),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.inner.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.inner.condvar.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.inner.count.lock()
    }

    /// Force the count to zero, releasing all waiters.
    pub fn drain(&self) {
        let mut count = self.inner.count.lock();
        *count = 0;
        self.inner.condvar.notify_all();
    }

    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.condvar.wait(&mut count);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.inner.count.lock();
        if *count == 0 {
            return true;
        }
        self.inner.condvar.wait_for(&mut count, timeout);
        *count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_latch_signal_releases_waiter() {
        let latch = Latch::new();
        let latch2 = latch.clone();
        let handle = thread::spawn(move || latch2.wait());
        thread::sleep(Duration::from_millis(10));
        latch.signal_all();
        handle.join().unwrap();
        assert!(latch.is_signaled());
    }

    #[test]
    fn test_latch_wait_after_signal_returns_immediately() {
        let latch = Latch::new();
        latch.signal_all();
        let start = Instant::now();
        latch.wait();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_latch_wait_timeout_expires() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_countdown_reaches_zero() {
        let latch = CountdownLatch::new(2);
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        latch.wait();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_countdown_drain_unblocks() {
        let latch = CountdownLatch::new(3);
        let latch2 = latch.clone();
        let handle = thread::spawn(move || latch2.wait());
        thread::sleep(Duration::from_millis(10));
        latch.drain();
        handle.join().unwrap();
    }

    #[test]
    fn test_countdown_below_zero_is_noop() {
        let latch = CountdownLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }
}
