//! End-to-end test on the process interval timer.
//!
//! `ITIMER_REAL` is process-wide, so everything that installs a
//! `SignalTimer` lives in this single test.

#![cfg(unix)]

use psched::{PschedError, RecurringOperation, SignalTimer, Tick, TimerError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn test_signal_timer_drives_operation_and_is_exclusive() -> TestResult {
    let op = RecurringOperation::with_timer(Duration::from_millis(10), SignalTimer::new())?;
    let calls = Arc::new(AtomicU64::new(0));
    let calls_in = Arc::clone(&calls);

    op.start(
        move |_tick: Tick| {
            calls_in.fetch_add(1, Ordering::SeqCst);
        },
        Some(5),
    )?;

    // The process timer has a single owner.
    let rival = RecurringOperation::new(Duration::from_millis(10))?;
    let second = rival.start(|_tick: Tick| (), Some(1));
    assert!(
        matches!(second, Err(PschedError::Timer(TimerError::Busy))),
        "second start: {second:?}"
    );
    assert!(!rival.is_active());

    assert!(op.wait_timeout(Duration::from_secs(10))?, "run did not finish");
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(!op.is_active());

    // Ownership is released by stop, so the rival can now run.
    rival.start(|_tick: Tick| (), Some(2))?;
    assert!(rival.wait_timeout(Duration::from_secs(10))?, "rival did not finish");
    assert_eq!(rival.iteration_count(), 2);
    Ok(())
}
