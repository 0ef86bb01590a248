//! Interruptible sleeps for the worker threads

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A flag that wakes every sleeper once set
#[derive(Debug, Default)]
pub struct Interrupt {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.flag.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Sleep for `dur`. Returns `false` if interrupted.
    pub fn sleep_for(&self, dur: Duration) -> bool {
        let mut flag = self.flag.lock();
        if *flag {
            return false;
        }
        let deadline = std::time::Instant::now() + dur;
        while !*flag {
            if self.cond.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        !*flag
    }
}

/// One-shot wakeup for a single waiting thread. A notification sent while
/// nobody waits is kept for the next wait.
#[derive(Debug, Default)]
pub struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Wait for a notification or `timeout`. Returns whether notified.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_sleep_completes() {
        let interrupt = Interrupt::new();
        assert!(interrupt.sleep_for(Duration::from_millis(10)));
    }

    #[test]
    fn test_trigger_wakes_sleeper() {
        let interrupt = Arc::new(Interrupt::new());
        let waker = interrupt.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.trigger();
        });
        assert!(!interrupt.sleep_for(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();

        // Stays set until reset
        assert!(!interrupt.sleep_for(Duration::from_secs(10)));
        interrupt.reset();
        assert!(interrupt.sleep_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_signal_kept_until_waited() {
        let signal = Signal::new();
        signal.notify();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        // Consumed
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }
}
