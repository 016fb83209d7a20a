//! The public timer facade.
//!
//! [`WheelTimer`] owns the shared state and the worker thread. Producers on
//! any thread call [`schedule`](WheelTimer::schedule) and receive an
//! `Arc<Timeout>` cancellation handle; the worker fires expired tasks.
//! [`stop`](WheelTimer::stop) shuts the worker down and returns every
//! timeout that neither fired nor was cancelled.

use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::bucket::Bucket;
use crate::sync::Event;
use crate::clock::{ceil_to_ms_boundary, duration_to_units, units_to_ms_ceil, Clock, UNITS_PER_MS};
use crate::error::TimerError;
use crate::task::TimerTask;
use crate::timeout::Timeout;
use crate::worker;

pub(crate) const WORKER_INIT: u8 = 0;
pub(crate) const WORKER_STARTED: u8 = 1;
pub(crate) const WORKER_SHUTDOWN: u8 = 2;

const MAX_TICKS_PER_WHEEL: usize = 1 << 30;
const INSTANCE_WARN_THRESHOLD: usize = 64;
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_millis(100);

const DEFAULT_TICK_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_TICKS_PER_WHEEL: usize = 512;
const DEFAULT_THREAD_NAME: &str = "tickwheel-worker";

/// Live timer instances in this process. One wheel usually serves a whole
/// application; the counter exists to flag accidental per-connection
/// construction.
static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(0);
static INSTANCE_WARNING_FIRED: AtomicBool = AtomicBool::new(false);

fn release_instance_slot() {
    INSTANCE_COUNT.fetch_sub(1, Ordering::Relaxed);
}

/// State shared between the facade, producers, and the worker thread.
pub(crate) struct TimerShared {
    pub(crate) clock: Clock,
    /// Tick duration in 100 ns units.
    pub(crate) tick_units: u64,
    /// Wheel length minus one; the wheel length is a power of two.
    pub(crate) mask: u64,
    pub(crate) worker_state: AtomicU8,
    /// Start instant in 100 ns units. Zero means "not yet started";
    /// written exactly once by the worker with release ordering.
    pub(crate) start_time: AtomicU64,
    /// Latch released once `start_time` is published.
    pub(crate) started: Event,
    /// Cancels the worker's tick sleep on shutdown.
    pub(crate) shutdown_signal: Event,
    /// Set by the worker after the unprocessed set is populated.
    pub(crate) worker_done: Event,
    /// New submissions, multi-producer / worker-consumer.
    pub(crate) pending: SegQueue<Arc<Timeout>>,
    /// Records whose owners requested cancellation.
    pub(crate) cancelled: SegQueue<Arc<Timeout>>,
    pending_count: AtomicI64,
    /// Maximum live submissions; zero disables the limit.
    max_pending: u64,
    /// Buckets, pre-allocated at construction and taken by the worker on
    /// its first iteration.
    pub(crate) wheel: Mutex<Option<Vec<Bucket>>>,
    pub(crate) unprocessed: Mutex<Vec<Arc<Timeout>>>,
    pub(crate) worker_thread: OnceLock<ThreadId>,
}

impl TimerShared {
    pub(crate) fn wheel_len(&self) -> u64 {
        self.mask + 1
    }

    pub(crate) fn decrement_pending(&self) {
        self.pending_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Builder for [`WheelTimer`].
///
/// Defaults: 100 ms tick, 512-slot wheel, no pending limit.
#[derive(Debug, Clone)]
pub struct WheelTimerBuilder {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    max_pending_timeouts: u64,
    thread_name: String,
}

impl Default for WheelTimerBuilder {
    fn default() -> Self {
        Self {
            tick_duration: DEFAULT_TICK_DURATION,
            ticks_per_wheel: DEFAULT_TICKS_PER_WHEEL,
            max_pending_timeouts: 0,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl WheelTimerBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tick duration, the wheel's scheduling granularity.
    ///
    /// Must be at least 100 ns; timeouts fire on the first tick boundary
    /// at or after their deadline.
    #[must_use]
    pub fn tick_duration(mut self, tick_duration: Duration) -> Self {
        self.tick_duration = tick_duration;
        self
    }

    /// Sets the number of wheel slots, normalised up to a power of two.
    #[must_use]
    pub fn ticks_per_wheel(mut self, ticks_per_wheel: usize) -> Self {
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    /// Caps the number of live (scheduled but not yet fired, cancelled, or
    /// reported unprocessed) timeouts. Zero disables the limit.
    #[must_use]
    pub fn max_pending_timeouts(mut self, max_pending_timeouts: u64) -> Self {
        self.max_pending_timeouts = max_pending_timeouts;
        self
    }

    /// Names the worker thread.
    #[must_use]
    pub fn thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Validates the configuration and builds the timer.
    ///
    /// The worker thread is not spawned until [`WheelTimer::start`] (or the
    /// first [`WheelTimer::schedule`]).
    pub fn build(self) -> Result<WheelTimer, TimerError> {
        if self.ticks_per_wheel == 0 || self.ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(TimerError::InvalidTicksPerWheel(self.ticks_per_wheel));
        }
        let tick_units = duration_to_units(self.tick_duration);
        if tick_units == 0 {
            return Err(TimerError::InvalidTickDuration(self.tick_duration));
        }
        if units_to_ms_ceil(tick_units) > i32::MAX as u64 {
            return Err(TimerError::InvalidTickDuration(self.tick_duration));
        }
        let wheel_len = self.ticks_per_wheel.next_power_of_two() as u64;
        // The deadline arithmetic works in a signed-64 range; one full
        // revolution must stay inside it.
        match tick_units.checked_mul(wheel_len) {
            Some(span) if span <= i64::MAX as u64 => {}
            _ => return Err(TimerError::InvalidTickDuration(self.tick_duration)),
        }

        let wheel = (0..wheel_len).map(|_| Bucket::new()).collect();
        let shared = Arc::new(TimerShared {
            clock: Clock::new(),
            tick_units,
            mask: wheel_len - 1,
            worker_state: AtomicU8::new(WORKER_INIT),
            start_time: AtomicU64::new(0),
            started: Event::new(),
            shutdown_signal: Event::new(),
            worker_done: Event::new(),
            pending: SegQueue::new(),
            cancelled: SegQueue::new(),
            pending_count: AtomicI64::new(0),
            max_pending: self.max_pending_timeouts,
            wheel: Mutex::new(Some(wheel)),
            unprocessed: Mutex::new(Vec::new()),
            worker_thread: OnceLock::new(),
        });

        let instances = INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if instances > INSTANCE_WARN_THRESHOLD
            && INSTANCE_WARNING_FIRED
                .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!(
                instances,
                "many WheelTimer instances are live; one shared instance usually suffices",
            );
        }

        Ok(WheelTimer {
            shared,
            worker_handle: Mutex::new(None),
            thread_name: self.thread_name,
        })
    }
}

/// A hashed-wheel timer.
///
/// Scheduling and cancellation are amortised O(1); firing is approximate,
/// bounded by the configured tick. All methods may be called from any
/// thread, except that [`stop`](Self::stop) must not run on the worker.
pub struct WheelTimer {
    shared: Arc<TimerShared>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
}

impl WheelTimer {
    /// Creates a timer with the default configuration (100 ms tick,
    /// 512-slot wheel, no pending limit).
    #[must_use]
    pub fn new() -> Self {
        Self::builder()
            .build()
            .expect("default timer configuration is valid")
    }

    /// Returns a configuration builder.
    #[must_use]
    pub fn builder() -> WheelTimerBuilder {
        WheelTimerBuilder::new()
    }

    /// Starts the worker thread if it is not running yet.
    ///
    /// Idempotent; blocks until the worker has published its start
    /// instant, so deadlines computed afterwards are well-defined.
    ///
    /// # Errors
    ///
    /// [`TimerError::Stopped`] if the timer was already stopped.
    pub fn start(&self) -> Result<(), TimerError> {
        match self.shared.worker_state.load(Ordering::Acquire) {
            WORKER_INIT => {
                if self
                    .shared
                    .worker_state
                    .compare_exchange(
                        WORKER_INIT,
                        WORKER_STARTED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let shared = Arc::clone(&self.shared);
                    let handle = thread::Builder::new()
                        .name(self.thread_name.clone())
                        .spawn(move || worker::run(shared))
                        .expect("failed to spawn timer worker thread");
                    *self
                        .worker_handle
                        .lock()
                        .expect("worker handle lock poisoned") = Some(handle);
                } else if self.shared.worker_state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
                    // Lost the race to a concurrent stop(); no worker will
                    // ever publish a start instant.
                    return Err(TimerError::Stopped);
                }
            }
            WORKER_STARTED => {}
            _ => return Err(TimerError::Stopped),
        }

        while self.shared.start_time.load(Ordering::Acquire) == 0 {
            self.shared.started.wait();
        }
        Ok(())
    }

    /// Schedules `task` to run once, `delay` from now.
    ///
    /// Starts the worker lazily. The deadline is rounded up to the next
    /// millisecond and the task fires on the first tick boundary at or
    /// after it — never early, up to one tick late plus scheduling jitter.
    /// Neither blocks nor spins once the timer is running.
    ///
    /// The returned handle cancels the timeout and reports its state.
    ///
    /// # Errors
    ///
    /// [`TimerError::PendingLimitReached`] if a pending limit is configured
    /// and would be exceeded (the counter is restored first), or
    /// [`TimerError::Stopped`] if the timer was stopped.
    pub fn schedule<T>(&self, task: T, delay: Duration) -> Result<Arc<Timeout>, TimerError>
    where
        T: TimerTask + 'static,
    {
        let pending = self.shared.pending_count.fetch_add(1, Ordering::Relaxed) + 1;
        let limit = i64::try_from(self.shared.max_pending).unwrap_or(i64::MAX);
        if self.shared.max_pending != 0 && pending > limit {
            self.shared.decrement_pending();
            return Err(TimerError::PendingLimitReached {
                pending: u64::try_from(pending).unwrap_or(0),
                limit: self.shared.max_pending,
            });
        }
        if let Err(err) = self.start() {
            self.shared.decrement_pending();
            return Err(err);
        }

        let now = self.shared.clock.now_units();
        let start = self.shared.start_time.load(Ordering::Acquire);
        let deadline =
            ceil_to_ms_boundary(now.saturating_sub(start).saturating_add(duration_to_units(delay)));

        let timeout = Timeout::new(
            Arc::clone(&self.shared),
            Box::new(task),
            deadline,
        );
        self.shared.pending.push(Arc::clone(&timeout));
        Ok(timeout)
    }

    /// Stops the timer and returns the timeouts that never ran.
    ///
    /// Signals the worker, waits up to 100 ms for it to exit, and returns
    /// every record that was scheduled but neither fired nor was
    /// cancelled. Subsequent calls return an empty set. After `stop()` no
    /// new work is accepted.
    ///
    /// # Errors
    ///
    /// [`TimerError::CalledFromWorker`] when invoked from a timer task.
    pub fn stop(&self) -> Result<Vec<Arc<Timeout>>, TimerError> {
        if let Some(worker_id) = self.shared.worker_thread.get() {
            if *worker_id == thread::current().id() {
                return Err(TimerError::CalledFromWorker);
            }
        }

        if self
            .shared
            .worker_state
            .compare_exchange(
                WORKER_STARTED,
                WORKER_SHUTDOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Never started, or another stop() won. Make sure the state is
            // final and release the instance slot exactly once.
            if self.shared.worker_state.swap(WORKER_SHUTDOWN, Ordering::AcqRel) != WORKER_SHUTDOWN {
                release_instance_slot();
            }
            return Ok(Vec::new());
        }

        self.shared.shutdown_signal.set();
        let exited = self.shared.worker_done.wait_timeout(WORKER_JOIN_TIMEOUT);
        if let Some(handle) = self
            .worker_handle
            .lock()
            .expect("worker handle lock poisoned")
            .take()
        {
            if exited {
                let _ = handle.join();
            } else {
                tracing::warn!(
                    timeout_ms = WORKER_JOIN_TIMEOUT.as_millis() as u64,
                    "timer worker did not exit in time; detaching",
                );
            }
        }
        release_instance_slot();

        let unprocessed = std::mem::take(
            &mut *self
                .shared
                .unprocessed
                .lock()
                .expect("unprocessed lock poisoned"),
        );
        Ok(unprocessed)
    }

    /// Number of live timeouts: scheduled but not yet fired, cancelled, or
    /// reported unprocessed.
    #[must_use]
    pub fn pending_timeouts(&self) -> u64 {
        u64::try_from(self.shared.pending_count.load(Ordering::Relaxed)).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn shared_for_tests(&self) -> &Arc<TimerShared> {
        &self.shared
    }
}

impl Default for WheelTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.worker_state.load(Ordering::Acquire) {
            WORKER_STARTED => "started",
            WORKER_SHUTDOWN => "shutdown",
            _ => "init",
        };
        f.debug_struct("WheelTimer")
            .field("state", &state)
            .field("tick_ms", &(self.shared.tick_units / UNITS_PER_MS))
            .field("wheel_len", &self.shared.wheel_len())
            .field("pending_timeouts", &self.pending_timeouts())
            .finish()
    }
}

impl Drop for WheelTimer {
    fn drop(&mut self) {
        // Release the instance slot exactly once even without a prior
        // stop(), and let a still-running worker wind down.
        if self.shared.worker_state.swap(WORKER_SHUTDOWN, Ordering::AcqRel) != WORKER_SHUTDOWN {
            release_instance_slot();
        }
        self.shared.shutdown_signal.set();
    }
}
