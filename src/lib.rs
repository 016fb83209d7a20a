//! Tickwheel: a hashed-wheel timer for large volumes of one-shot timeouts.
//!
//! # Overview
//!
//! A [`WheelTimer`] manages tens or hundreds of thousands of pending
//! timeouts with amortised O(1) scheduling and cancellation. It trades
//! per-timer precision — firing is quantised to a configurable tick — for
//! a single advancing cursor and a handful of operations per tick.
//!
//! Producers on any thread submit `(task, delay)` pairs and receive a
//! cancellation handle; one dedicated worker thread advances the wheel,
//! fires expired tasks, and drains cancellations.
//!
//! # Guarantees
//!
//! - **Never early**: a task fires no earlier than its deadline, rounded up
//!   to the next millisecond; it may be late by up to one tick plus
//!   scheduling jitter.
//! - **At most once**: a task either fires exactly once, is cancelled and
//!   never runs, or is returned from [`WheelTimer::stop`] unprocessed.
//! - **Bounded tick work**: per tick the worker moves at most a fixed batch
//!   of new submissions, so a hot producer cannot stall the cursor.
//! - **Non-blocking producers**: `schedule` and `cancel` never block once
//!   the worker is running.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tickwheel::{Timeout, WheelTimer};
//!
//! let timer = WheelTimer::new();
//! let handle = timer
//!     .schedule(|t: &Timeout| println!("fired: {t:?}"), Duration::from_millis(250))
//!     .expect("timer accepts work");
//!
//! // Changed our mind: cancellation is O(1) and idempotent.
//! if handle.cancel() {
//!     assert!(handle.is_cancelled());
//! }
//!
//! // Shutdown returns whatever never ran.
//! let unprocessed = timer.stop().expect("not on the worker thread");
//! println!("{} timeouts never fired", unprocessed.len());
//! ```
//!
//! # Module Structure
//!
//! - [`error`]: the [`TimerError`] taxonomy
//! - `clock`: monotonic 100 ns clock and millisecond-ceiling conversions
//! - `sync`: one-shot events for start/shutdown signalling
//! - `task`: the [`TimerTask`] contract
//! - `timeout`: the [`Timeout`] record and its state machine
//! - `bucket`: intrusive per-slot timeout lists (worker-only)
//! - `worker`: the tick loop
//! - `timer`: the [`WheelTimer`] facade and its builder

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_panics_doc)]

mod bucket;
mod clock;
pub mod error;
mod sync;
mod task;
pub mod test_utils;
mod timeout;
mod timer;
mod worker;

pub use error::TimerError;
pub use task::TimerTask;
pub use timeout::Timeout;
pub use timer::{WheelTimer, WheelTimerBuilder};
