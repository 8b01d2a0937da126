//! Single-slot wake signal for the meter threads.
//!
//! `notify` sets the slot; a waiter consumes it. Several notifications
//! before a wait collapse into one wake, and a waiter may wake with no new
//! work, so callers re-check their own state after every wake.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Sticky, reset-on-consume wake flag.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake one waiter.
    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Block until notified or `stop` is set. Returns whether a
    /// notification was consumed.
    pub fn wait(&self, stop: &AtomicBool) -> bool {
        let mut pending = self.pending.lock();
        while !*pending && !stop.load(Ordering::SeqCst) {
            self.cond.wait(&mut pending);
        }
        std::mem::replace(&mut *pending, false)
    }

    /// Block until notified or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }

    /// Whether a notification is waiting to be consumed.
    pub fn is_pending(&self) -> bool {
        *self.pending.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notifications_collapse() {
        let signal = WakeSignal::new();
        signal.notify();
        signal.notify();
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn notify_wakes_blocked_waiter() {
        let signal = Arc::new(WakeSignal::new());
        let stop = Arc::new(AtomicBool::new(false));

        let waiter = {
            let signal = signal.clone();
            let stop = stop.clone();
            thread::spawn(move || signal.wait(&stop))
        };

        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn stop_releases_waiter_without_notification() {
        let signal = WakeSignal::new();
        let stop = AtomicBool::new(true);
        assert!(!signal.wait(&stop));
    }
}
