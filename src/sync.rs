//! One-shot signalling between producer threads and the worker.
//!
//! [`Event`] is a latch: once set it stays set, and every past or future
//! waiter observes it. The timer uses three of them — the start latch that
//! `start()` blocks on, the shutdown signal that cancels the worker's tick
//! sleep, and the worker-exit signal that bounds the join in `stop()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot event that threads can block on.
#[derive(Debug)]
pub(crate) struct Event {
    set: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Sets the event and wakes every waiter. Idempotent.
    pub(crate) fn set(&self) {
        self.set.store(true, Ordering::Release);
        let _guard = self.mutex.lock().expect("event mutex poisoned");
        self.condvar.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Blocks until the event is set.
    pub(crate) fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut guard = self.mutex.lock().expect("event mutex poisoned");
        while !self.is_set() {
            guard = self.condvar.wait(guard).expect("event mutex poisoned");
        }
        drop(guard);
    }

    /// Blocks until the event is set or `timeout` elapses.
    ///
    /// Returns `true` if the event was set, `false` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock().expect("event mutex poisoned");
        while !self.is_set() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _) = self
                .condvar
                .wait_timeout(guard, remaining)
                .expect("event mutex poisoned");
            guard = next;
        }
        drop(guard);
        true
    }
}
