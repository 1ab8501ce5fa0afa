use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A single-use countdown synchronizer.
///
/// The latch starts at a fixed count; [`count_down`](Self::count_down)
/// decrements it, and [`wait`](Self::wait) blocks until it reaches zero.
/// Once at zero the latch stays open forever. A pipeline counts its
/// completion latch down exactly once when every worker has exited.
pub struct CountdownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountdownLatch {
    /// Create a latch that opens after `count` calls to `count_down`.
    /// A latch created with count zero is already open.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrement the count, waking all waiters when it reaches zero.
    /// Counting down an open latch is a no-op.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or `timeout` elapses. Returns
    /// true if the latch opened.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Current count. A snapshot; mostly useful once the latch is known to
    /// be quiescent.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}
