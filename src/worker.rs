#![allow(unsafe_code)]
//! The timer's worker loop.
//!
//! One dedicated thread owns the wheel, the cursor, and the start instant.
//! Each iteration waits for the next tick boundary, drains the cancellation
//! queue, transfers a bounded batch of new submissions into their buckets,
//! and expires the current bucket. On shutdown it collects every record
//! that neither fired nor was cancelled into the unprocessed set.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::bucket::Bucket;
use crate::clock::units_to_ms_ceil;
use crate::timeout::{panic_message, Placement, Timeout};
use crate::timer::{TimerShared, WORKER_STARTED};

/// Cap on submissions moved into buckets per tick, so a hot producer
/// cannot starve tick progress.
const MAX_TRANSFERS_PER_TICK: usize = 100_000;

/// Outcome of waiting for the next tick boundary.
enum TickWait {
    /// The boundary passed; carries the current time in 100 ns units
    /// relative to the start instant, used as the expiry deadline.
    Elapsed(u64),
    /// The shutdown signal cancelled the wait.
    Shutdown,
}

/// Absolute tick a deadline falls into, rounding up.
pub(crate) fn deadline_tick(deadline: u64, tick_units: u64) -> u64 {
    deadline.div_ceil(tick_units)
}

/// Full wheel revolutions to wait before the record's bucket pass fires it.
pub(crate) fn remaining_rounds(calculated: u64, current_tick: u64, wheel_len: u64) -> i64 {
    let calculated = i64::try_from(calculated).unwrap_or(i64::MAX);
    let current = i64::try_from(current_tick).unwrap_or(i64::MAX);
    (calculated - current) / wheel_len as i64
}

/// Worker-thread entry point.
pub(crate) fn run(shared: Arc<TimerShared>) {
    let _ = shared.worker_thread.set(thread::current().id());

    // Zero is reserved for "not yet started".
    let mut start_units = shared.clock.now_units();
    if start_units == 0 {
        start_units = 1;
    }
    shared.start_time.store(start_units, Ordering::Release);
    shared.started.set();

    let wheel = shared
        .wheel
        .lock()
        .expect("wheel lock poisoned")
        .take()
        .expect("worker started more than once");

    let mut worker = Worker {
        shared: Arc::clone(&shared),
        wheel,
        tick: 0,
        start_units,
        unprocessed: Vec::new(),
    };
    worker.run_loop();
    worker.collect_unprocessed();

    let unprocessed = std::mem::take(&mut worker.unprocessed);
    *shared
        .unprocessed
        .lock()
        .expect("unprocessed lock poisoned") = unprocessed;
    shared.worker_done.set();
}

struct Worker {
    shared: Arc<TimerShared>,
    wheel: Vec<Bucket>,
    tick: u64,
    start_units: u64,
    unprocessed: Vec<Arc<Timeout>>,
}

impl Worker {
    fn run_loop(&mut self) {
        while self.shared.worker_state.load(Ordering::Acquire) == WORKER_STARTED {
            let deadline = match self.wait_for_next_tick() {
                TickWait::Shutdown => break,
                TickWait::Elapsed(now) => now,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.process_cancelled();
                self.transfer_to_buckets();
                let index = (self.tick & self.shared.mask) as usize;
                self.wheel[index].expire(deadline);
            }));
            match outcome {
                Ok(()) => self.tick += 1,
                Err(payload) => {
                    tracing::error!(
                        tick = self.tick,
                        panic = panic_message(&*payload),
                        "timer worker failed; terminating",
                    );
                    break;
                }
            }
        }
    }

    /// Sleeps until the next tick boundary or the shutdown signal.
    ///
    /// The sleep is quantised to whole milliseconds, rounding up, so a
    /// tick is never reported elapsed before its boundary.
    fn wait_for_next_tick(&self) -> TickWait {
        let target = self.shared.tick_units.saturating_mul(self.tick + 1);
        loop {
            let current = self.shared.clock.now_units().saturating_sub(self.start_units);
            if current >= target {
                return TickWait::Elapsed(current);
            }
            let sleep_ms = units_to_ms_ceil(target - current);
            if self
                .shared
                .shutdown_signal
                .wait_timeout(Duration::from_millis(sleep_ms))
                && self.shared.worker_state.load(Ordering::Acquire) != WORKER_STARTED
            {
                return TickWait::Shutdown;
            }
        }
    }

    /// Unlinks every record whose cancellation has been requested.
    fn process_cancelled(&mut self) {
        while let Some(timeout) = self.shared.cancelled.pop() {
            // SAFETY: link access happens only on this thread.
            let placement = unsafe { timeout.links().placement };
            match placement {
                Placement::Linked(index) => {
                    let node = NonNull::from(&*timeout);
                    // SAFETY: the record reported itself linked in that
                    // bucket; the bucket unlinks and settles the account.
                    unsafe {
                        self.wheel[index].remove(node);
                    }
                }
                Placement::Queued => {
                    // Still sitting in the submission queue; settle the
                    // account now and let the transfer pass drop it.
                    // SAFETY: worker-only link access.
                    unsafe {
                        timeout.links().placement = Placement::Gone;
                    }
                    self.shared.decrement_pending();
                }
                Placement::Gone => {}
            }
        }
    }

    /// Moves a bounded batch of new submissions into their buckets.
    fn transfer_to_buckets(&mut self) {
        for _ in 0..MAX_TRANSFERS_PER_TICK {
            let Some(timeout) = self.shared.pending.pop() else {
                break;
            };
            if timeout.is_cancelled() {
                // SAFETY: worker-only link access.
                let links = unsafe { timeout.links() };
                if links.placement == Placement::Queued {
                    links.placement = Placement::Gone;
                    self.shared.decrement_pending();
                }
                continue;
            }
            let calculated = deadline_tick(timeout.deadline(), self.shared.tick_units);
            let rounds = remaining_rounds(calculated, self.tick, self.shared.wheel_len());
            // Never schedule into a tick that already passed.
            let ticks = calculated.max(self.tick);
            let index = (ticks & self.shared.mask) as usize;
            // SAFETY: worker-only link access.
            unsafe {
                timeout.links().rounds = rounds;
            }
            self.wheel[index].push(timeout, index);
        }
    }

    /// Shutdown path: drain buckets and queues into the unprocessed set.
    fn collect_unprocessed(&mut self) {
        for bucket in &mut self.wheel {
            bucket.clear_into(&mut self.unprocessed);
        }
        while let Some(timeout) = self.shared.pending.pop() {
            // SAFETY: worker-only link access.
            let links = unsafe { timeout.links() };
            if links.placement == Placement::Queued {
                links.placement = Placement::Gone;
                self.shared.decrement_pending();
            }
            if !timeout.is_cancelled() {
                self.unprocessed.push(timeout);
            }
        }
        self.process_cancelled();
    }
}
