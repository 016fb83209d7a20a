//! End-to-end timer behaviour with a real worker thread.
//!
//! These tests drive the public API only: schedule, cancel, stop. Timing
//! assertions use wide windows so scheduler jitter cannot produce flakes;
//! the tight bounds on tick and rounds math live in the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tickwheel::test_utils::init_test_logging;
use tickwheel::{Timeout, TimerError, WheelTimer};

fn timer_100ms(ticks_per_wheel: usize) -> WheelTimer {
    WheelTimer::builder()
        .tick_duration(Duration::from_millis(100))
        .ticks_per_wheel(ticks_per_wheel)
        .build()
        .expect("valid configuration")
}

fn counter_task(counter: &Arc<AtomicUsize>) -> impl Fn(&Timeout) + Send + Sync {
    let counter = Arc::clone(counter);
    move |_t: &Timeout| {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let give_up = Instant::now() + deadline;
    while Instant::now() < give_up {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn single_timeout_fires_after_its_deadline() {
    init_test_logging();
    tickwheel::test_phase!("single_timeout_fires_after_its_deadline");
    let timer = timer_100ms(8);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = timer
        .schedule(counter_task(&fired), Duration::from_millis(250))
        .expect("schedule");

    // Deadline 250 ms rounds up to the 300 ms tick boundary; well before
    // that nothing may fire.
    thread::sleep(Duration::from_millis(120));
    tickwheel::assert_with_log!(
        fired.load(Ordering::SeqCst) == 0,
        "no early fire",
        0,
        fired.load(Ordering::SeqCst)
    );
    assert!(!handle.is_expired());

    let ran = wait_until(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 1
    });
    tickwheel::assert_with_log!(ran, "fired exactly once", 1, fired.load(Ordering::SeqCst));
    assert!(handle.is_expired());
    assert!(!handle.is_cancelled());

    timer.stop().expect("stop");
    tickwheel::test_complete!("single_timeout_fires_after_its_deadline");
}

#[test]
fn cancel_before_fire_suppresses_the_task() {
    init_test_logging();
    tickwheel::test_phase!("cancel_before_fire_suppresses_the_task");
    let timer = timer_100ms(8);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = timer
        .schedule(counter_task(&fired), Duration::from_secs(1))
        .expect("schedule");

    thread::sleep(Duration::from_millis(200));
    let first_cancel = handle.cancel();
    tickwheel::assert_with_log!(first_cancel, "first cancel wins", true, first_cancel);
    assert!(!handle.cancel(), "second cancel is a no-op");
    assert!(handle.is_cancelled());

    // Wait past the original deadline; the task must never run.
    thread::sleep(Duration::from_millis(1200));
    tickwheel::assert_with_log!(
        fired.load(Ordering::SeqCst) == 0,
        "cancelled task never runs",
        0,
        fired.load(Ordering::SeqCst)
    );
    assert!(!handle.is_expired());

    timer.stop().expect("stop");
    tickwheel::test_complete!("cancel_before_fire_suppresses_the_task");
}

#[test]
fn wrap_around_waits_full_revolutions() {
    init_test_logging();
    tickwheel::test_phase!("wrap_around_waits_full_revolutions");
    // Four slots at 100 ms cover 400 ms per revolution; a 1200 ms delay
    // must survive three passes of its bucket before firing.
    let timer = timer_100ms(4);
    let fired = Arc::new(AtomicUsize::new(0));
    let _handle = timer
        .schedule(counter_task(&fired), Duration::from_millis(1200))
        .expect("schedule");

    thread::sleep(Duration::from_millis(1000));
    tickwheel::assert_with_log!(
        fired.load(Ordering::SeqCst) == 0,
        "no fire before the last revolution",
        0,
        fired.load(Ordering::SeqCst)
    );

    let ran = wait_until(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 1
    });
    tickwheel::assert_with_log!(ran, "fired after wrap-around", 1, fired.load(Ordering::SeqCst));

    timer.stop().expect("stop");
    tickwheel::test_complete!("wrap_around_waits_full_revolutions");
}

#[test]
fn pending_limit_rejects_and_recovers() {
    init_test_logging();
    tickwheel::test_phase!("pending_limit_rejects_and_recovers");
    let timer = WheelTimer::builder()
        .tick_duration(Duration::from_millis(20))
        .ticks_per_wheel(8)
        .max_pending_timeouts(2)
        .build()
        .expect("valid configuration");

    let idle = |_t: &Timeout| {};
    let first = timer.schedule(idle, Duration::from_secs(3600)).expect("first");
    let _second = timer.schedule(idle, Duration::from_secs(3600)).expect("second");

    let err = timer.schedule(idle, Duration::from_secs(3600)).unwrap_err();
    tickwheel::assert_with_log!(
        matches!(err, TimerError::PendingLimitReached { limit: 2, .. }),
        "third submission rejected",
        "PendingLimitReached",
        err
    );
    tickwheel::assert_with_log!(
        timer.pending_timeouts() == 2,
        "counter restored after rejection",
        2,
        timer.pending_timeouts()
    );

    assert!(first.cancel());
    let drained = wait_until(Duration::from_secs(5), || timer.pending_timeouts() == 1);
    tickwheel::assert_with_log!(drained, "cancellation frees a slot", 1, timer.pending_timeouts());

    timer
        .schedule(idle, Duration::from_secs(3600))
        .expect("slot is available again");

    timer.stop().expect("stop");
    tickwheel::test_complete!("pending_limit_rejects_and_recovers");
}

#[test]
fn shutdown_collects_unprocessed_timeouts() {
    init_test_logging();
    tickwheel::test_phase!("shutdown_collects_unprocessed_timeouts");
    let timer = timer_100ms(8);
    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        timer
            .schedule(counter_task(&fired), Duration::from_secs(10))
            .expect("schedule");
    }

    thread::sleep(Duration::from_millis(150));
    let unprocessed = timer.stop().expect("stop");

    tickwheel::assert_with_log!(
        unprocessed.len() == 10,
        "all pending timeouts reported",
        10,
        unprocessed.len()
    );
    for timeout in &unprocessed {
        assert!(!timeout.is_expired(), "unprocessed timeout not expired");
        assert!(!timeout.is_cancelled(), "unprocessed timeout not cancelled");
    }
    tickwheel::assert_with_log!(
        fired.load(Ordering::SeqCst) == 0,
        "nothing ran",
        0,
        fired.load(Ordering::SeqCst)
    );
    tickwheel::assert_with_log!(
        timer.pending_timeouts() == 0,
        "accounting settled on shutdown",
        0,
        timer.pending_timeouts()
    );
    tickwheel::test_complete!("shutdown_collects_unprocessed_timeouts");
}

#[test]
fn zero_delay_fires_on_the_next_tick_boundary() {
    init_test_logging();
    tickwheel::test_phase!("zero_delay_fires_on_the_next_tick_boundary");
    // A long tick makes the boundary observable: the task may only run
    // once the first tick elapses, not at submission time.
    let timer = WheelTimer::builder()
        .tick_duration(Duration::from_millis(500))
        .ticks_per_wheel(8)
        .build()
        .expect("valid configuration");
    timer.start().expect("start");

    let fired = Arc::new(AtomicUsize::new(0));
    timer
        .schedule(counter_task(&fired), Duration::ZERO)
        .expect("schedule");

    thread::sleep(Duration::from_millis(100));
    tickwheel::assert_with_log!(
        fired.load(Ordering::SeqCst) == 0,
        "not fired before the first tick",
        0,
        fired.load(Ordering::SeqCst)
    );

    let ran = wait_until(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 1
    });
    tickwheel::assert_with_log!(ran, "fired on the tick boundary", 1, fired.load(Ordering::SeqCst));

    timer.stop().expect("stop");
    tickwheel::test_complete!("zero_delay_fires_on_the_next_tick_boundary");
}

#[test]
fn same_bucket_fires_in_insertion_order() {
    init_test_logging();
    tickwheel::test_phase!("same_bucket_fires_in_insertion_order");
    let timer = timer_100ms(8);
    let order = Arc::new(Mutex::new(Vec::new()));

    for id in 0..5_u32 {
        let order = Arc::clone(&order);
        timer
            .schedule(
                move |_t: &Timeout| order.lock().expect("order lock").push(id),
                Duration::from_millis(300),
            )
            .expect("schedule");
    }

    let ran = wait_until(Duration::from_secs(5), || {
        order.lock().expect("order lock").len() == 5
    });
    assert!(ran, "all five tasks ran");
    tickwheel::assert_with_log!(
        *order.lock().expect("order lock") == vec![0, 1, 2, 3, 4],
        "insertion order preserved",
        [0, 1, 2, 3, 4],
        order.lock().expect("order lock")
    );

    timer.stop().expect("stop");
    tickwheel::test_complete!("same_bucket_fires_in_insertion_order");
}

#[test]
fn panicking_task_does_not_stall_the_wheel() {
    init_test_logging();
    tickwheel::test_phase!("panicking_task_does_not_stall_the_wheel");
    let timer = timer_100ms(8);
    let fired = Arc::new(AtomicUsize::new(0));

    timer
        .schedule(
            |_t: &Timeout| panic!("task blew up"),
            Duration::from_millis(100),
        )
        .expect("schedule");
    timer
        .schedule(counter_task(&fired), Duration::from_millis(300))
        .expect("schedule");

    let ran = wait_until(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 1
    });
    tickwheel::assert_with_log!(
        ran,
        "later task fires despite the earlier panic",
        1,
        fired.load(Ordering::SeqCst)
    );

    timer.stop().expect("stop");
    tickwheel::test_complete!("panicking_task_does_not_stall_the_wheel");
}

#[test]
fn drop_without_stop_shuts_the_worker_down() {
    init_test_logging();
    tickwheel::test_phase!("drop_without_stop_shuts_the_worker_down");
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let timer = timer_100ms(8);
        timer
            .schedule(counter_task(&fired), Duration::from_secs(10))
            .expect("schedule");
        // Dropped without stop(); the worker notices and winds down.
    }
    thread::sleep(Duration::from_millis(300));
    tickwheel::assert_with_log!(
        fired.load(Ordering::SeqCst) == 0,
        "nothing fired after drop",
        0,
        fired.load(Ordering::SeqCst)
    );
    tickwheel::test_complete!("drop_without_stop_shuts_the_worker_down");
}
