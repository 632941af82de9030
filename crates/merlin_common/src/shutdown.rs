//! Cooperative shutdown signal for background loops.
//!
//! Dispatch loops (hints, schedulers) sleep between ticks; a bare
//! `thread::sleep` would make shutdown wait out the full interval. This
//! signal wakes sleepers within milliseconds of `shutdown()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        ShutdownSignal {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request shutdown and wake all sleepers.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`. Returns
    /// whether shutdown was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_starts_clear() {
        assert!(!ShutdownSignal::new().is_shutdown());
    }

    #[test]
    fn test_wakes_sleeper() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            (sig2.wait_timeout(Duration::from_secs(10)), start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (was_shutdown, elapsed) = handle.join().unwrap();
        assert!(was_shutdown);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_timeout_expires_without_shutdown() {
        let sig = ShutdownSignal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
    }
}
