//! Monotonic clock and unit conversions.
//!
//! All deadline arithmetic uses a single integer unit of 100 nanoseconds,
//! measured from the clock's epoch. Conversions to milliseconds happen only
//! at the sleep boundary and when rounding a submission deadline, and they
//! always round up so a timeout can never fire before its nominal deadline.

use std::time::{Duration, Instant};

/// Number of 100 ns units in one millisecond.
pub(crate) const UNITS_PER_MS: u64 = 10_000;

/// Monotonic clock reporting elapsed time in 100 ns units.
///
/// The epoch is the instant the clock was created; readings are
/// monotonically non-decreasing and never negative.
#[derive(Debug)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Elapsed time since the epoch in 100 ns units.
    pub(crate) fn now_units(&self) -> u64 {
        (self.epoch.elapsed().as_nanos() / 100) as u64
    }
}

/// Converts a duration to 100 ns units, saturating at `u64::MAX`.
pub(crate) fn duration_to_units(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos() / 100).unwrap_or(u64::MAX)
}

/// Rounds a unit count up to the next millisecond boundary.
pub(crate) fn ceil_to_ms_boundary(units: u64) -> u64 {
    units
        .checked_add(UNITS_PER_MS - 1)
        .map_or(u64::MAX - (u64::MAX % UNITS_PER_MS), |n| {
            n / UNITS_PER_MS * UNITS_PER_MS
        })
}

/// Converts a unit count to whole milliseconds, rounding up.
pub(crate) fn units_to_ms_ceil(units: u64) -> u64 {
    units.div_ceil(UNITS_PER_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_units_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_units();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_units();
        assert!(b > a, "clock went backwards: {a} -> {b}");
    }

    #[test]
    fn duration_conversion_uses_100ns_units() {
        assert_eq!(duration_to_units(Duration::from_millis(1)), UNITS_PER_MS);
        assert_eq!(duration_to_units(Duration::from_nanos(100)), 1);
        assert_eq!(duration_to_units(Duration::from_nanos(99)), 0);
        assert_eq!(duration_to_units(Duration::ZERO), 0);
    }

    #[test]
    fn ceiling_to_ms_boundary() {
        assert_eq!(ceil_to_ms_boundary(0), 0);
        assert_eq!(ceil_to_ms_boundary(1), UNITS_PER_MS);
        assert_eq!(ceil_to_ms_boundary(UNITS_PER_MS), UNITS_PER_MS);
        assert_eq!(ceil_to_ms_boundary(UNITS_PER_MS + 1), 2 * UNITS_PER_MS);
    }

    #[test]
    fn ceiling_to_whole_ms() {
        assert_eq!(units_to_ms_ceil(0), 0);
        assert_eq!(units_to_ms_ceil(1), 1);
        assert_eq!(units_to_ms_ceil(UNITS_PER_MS), 1);
        assert_eq!(units_to_ms_ceil(UNITS_PER_MS + 1), 2);
    }
}
