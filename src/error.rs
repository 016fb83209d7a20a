//! Error types for timer construction and operation.
//!
//! Errors are explicit and typed. Construction-time validation failures,
//! lifecycle violations, and admission rejections each get their own
//! variant so callers can match on the condition they care about.

use std::time::Duration;

/// Errors reported by [`WheelTimer`](crate::WheelTimer) and its builder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TimerError {
    /// The tick duration is zero, too coarse for a 32-bit millisecond
    /// sleep, or overflows the wheel's deadline arithmetic.
    #[error("tick duration {0:?} is out of range")]
    InvalidTickDuration(Duration),

    /// The requested wheel size is zero or larger than 2^30 slots.
    #[error("ticks per wheel {0} is out of range (1..=2^30)")]
    InvalidTicksPerWheel(usize),

    /// The timer was stopped and cannot accept new work or be restarted.
    #[error("timer was stopped and cannot be started again")]
    Stopped,

    /// `stop()` was invoked on the timer's own worker thread, which would
    /// deadlock the shutdown join.
    #[error("stop() may not be called from the timer worker thread")]
    CalledFromWorker,

    /// Admitting the submission would push the number of live timeouts
    /// past the configured limit. The pending counter is restored before
    /// this error is returned.
    #[error("pending timeouts ({pending}) would exceed the limit ({limit})")]
    PendingLimitReached {
        /// The count the rejected submission would have produced.
        pending: u64,
        /// The configured maximum number of pending timeouts.
        limit: u64,
    },
}
