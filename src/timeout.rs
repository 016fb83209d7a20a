#![allow(unsafe_code)]
//! The timeout record: task, deadline, state machine, and intrusive links.
//!
//! A [`Timeout`] is created by `schedule`, handed back to the caller as
//! `Arc<Timeout>` (the cancellation handle), and threaded through the
//! wheel's bucket lists by the worker. The record embeds its own `prev`/
//! `next` links so list membership costs no extra allocation.
//!
//! # State machine
//!
//! `state` moves monotonically by compare-and-set and never leaves a
//! terminal state:
//!
//! ```text
//! INIT ──cancel()──> CANCELLED
//! INIT ──expire()──> EXPIRED
//! ```
//!
//! `cancel()` may run on any thread; `expire()` only on the worker.
//!
//! # Safety
//!
//! The intrusive link block lives in an `UnsafeCell` and is read or written
//! exclusively by the worker thread (producers only touch the atomic state
//! and the cancellation queue). That single-thread discipline is what makes
//! the manual `Send`/`Sync` implementations below sound.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::clock::UNITS_PER_MS;
use crate::task::TimerTask;
use crate::timer::TimerShared;

const ST_INIT: u8 = 0;
const ST_CANCELLED: u8 = 1;
const ST_EXPIRED: u8 = 2;

/// Where a record currently lives, from the worker's point of view.
///
/// `Queued` records are still in the pending-submission queue, `Linked`
/// records sit in the wheel bucket with the given index, and `Gone` records
/// have reached a terminal disposition (fired, discarded after
/// cancellation, or reported unprocessed). The pending counter is
/// decremented exactly once, on the transition to `Gone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Queued,
    Linked(usize),
    Gone,
}

/// Worker-only link block embedded in every record.
pub(crate) struct Links {
    pub(crate) prev: Option<NonNull<Timeout>>,
    pub(crate) next: Option<NonNull<Timeout>>,
    pub(crate) placement: Placement,
    /// Full wheel revolutions left before this record's bucket pass fires
    /// it. Assigned on transfer into a bucket; negative for overdue work.
    pub(crate) rounds: i64,
}

/// A scheduled one-shot timeout. Also the handle returned to callers.
pub struct Timeout {
    task: Box<dyn TimerTask>,
    /// Absolute deadline in 100 ns units since the timer's start instant,
    /// rounded up to a millisecond boundary at submission.
    deadline: u64,
    state: AtomicU8,
    /// Owning timer, for pending-count bookkeeping and cancellation
    /// hand-off. The worker drains the queues that close this cycle.
    timer: Arc<TimerShared>,
    /// Self-reference so `cancel()` can enqueue the record by value.
    self_ref: Weak<Timeout>,
    links: UnsafeCell<Links>,
}

// SAFETY: `task` is `Send + Sync` by the `TimerTask` bounds, `state` is
// atomic, and `links` is only ever touched by the single worker thread.
unsafe impl Send for Timeout {}
// SAFETY: as above; shared references never expose `links` outside the
// worker thread.
unsafe impl Sync for Timeout {}

impl Timeout {
    pub(crate) fn new(
        timer: Arc<TimerShared>,
        task: Box<dyn TimerTask>,
        deadline: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            task,
            deadline,
            state: AtomicU8::new(ST_INIT),
            timer,
            self_ref: self_ref.clone(),
            links: UnsafeCell::new(Links {
                prev: None,
                next: None,
                placement: Placement::Queued,
                rounds: 0,
            }),
        })
    }

    /// Absolute deadline in 100 ns units since the timer's start instant.
    pub(crate) fn deadline(&self) -> u64 {
        self.deadline
    }

    pub(crate) fn shared(&self) -> &Arc<TimerShared> {
        &self.timer
    }

    /// The task this timeout will run on expiry.
    pub fn task(&self) -> &dyn TimerTask {
        &*self.task
    }

    /// Requests cancellation.
    ///
    /// Returns `true` if this call won the `INIT -> CANCELLED` transition;
    /// the task will then never run and the worker unlinks the record
    /// within one tick. Returns `false` if the record was already
    /// cancelled or has expired.
    pub fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(ST_INIT, ST_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // The worker unlinks the record on its next tick; until then it
        // stays wherever it is. The upgrade cannot fail while `&self` is
        // reachable through the handle.
        if let Some(record) = self.self_ref.upgrade() {
            self.timer.cancelled.push(record);
        }
        true
    }

    /// Whether cancellation won the state race.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == ST_CANCELLED
    }

    /// Whether the worker has fired (or is firing) this timeout.
    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == ST_EXPIRED
    }

    /// Fires the timeout: transitions `INIT -> EXPIRED` and runs the task.
    ///
    /// Worker-only. Loses the race silently if the record was cancelled
    /// first. A panicking task is caught and logged so the worker loop is
    /// not disrupted.
    pub(crate) fn expire(&self) {
        if self
            .state
            .compare_exchange(ST_INIT, ST_EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.task.run(self))) {
            tracing::warn!(
                deadline_ms = self.deadline / UNITS_PER_MS,
                panic = panic_message(&payload),
                "timer task panicked; continuing",
            );
        }
    }

    /// Exclusive access to the intrusive link block.
    ///
    /// # Safety
    ///
    /// Must only be called from the worker thread, and the returned
    /// reference must not outlive the current linking operation (callers
    /// re-borrow rather than holding it across other link accesses).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn links(&self) -> &mut Links {
        unsafe { &mut *self.links.get() }
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            ST_CANCELLED => "cancelled",
            ST_EXPIRED => "expired",
            _ => "pending",
        };
        f.debug_struct("Timeout")
            .field("deadline_ms", &(self.deadline / UNITS_PER_MS))
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// Best-effort rendering of a panic payload for log output.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
