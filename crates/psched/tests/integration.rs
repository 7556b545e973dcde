//! Integration tests for the psched crate.
//!
//! These drive real runs on `ThreadTimer`, which owns no process-wide state,
//! so they can execute in parallel with each other.

use parking_lot::Mutex;
use psched::{Control, OperationConfig, PschedError, RecurringOperation, ThreadTimer, Tick};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WAIT_LIMIT: Duration = Duration::from_secs(10);

fn operation(period: Duration) -> Result<RecurringOperation, PschedError> {
    RecurringOperation::with_timer(period, ThreadTimer::new())
}

fn counter() -> (Arc<AtomicU64>, Arc<AtomicU64>) {
    let count = Arc::new(AtomicU64::new(0));
    (Arc::clone(&count), count)
}

#[test]
fn test_bounded_run_completes_within_period() -> TestResult {
    let op = operation(Duration::from_millis(20))?;
    let (calls, seen) = counter();

    op.start(
        move |_tick: Tick| {
            calls.fetch_add(1, Ordering::SeqCst);
        },
        Some(5),
    )?;

    assert!(op.wait_timeout(WAIT_LIMIT)?, "run did not finish");
    assert_eq!(seen.load(Ordering::SeqCst), 5);
    assert_eq!(op.iteration_count(), 5);
    assert!(op.tet() < op.period());
    assert!(!op.is_active());
    assert!(!op.is_locked());

    let mut stats = op.stats();
    assert_eq!(stats.total_iterations, 5);
    assert_eq!(stats.late_iterations, 0);
    assert!(stats.p99_tet_ns() < 20_000_000);
    Ok(())
}

#[test]
fn test_bound_stops_further_invocations() -> TestResult {
    let op = operation(Duration::from_millis(5))?;
    let (calls, seen) = counter();

    op.start(
        move |_tick: Tick| {
            calls.fetch_add(1, Ordering::SeqCst);
        },
        Some(3),
    )?;
    op.wait()?;

    thread::sleep(Duration::from_millis(50));
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert!(!op.is_active());
    Ok(())
}

#[test]
fn test_invocations_never_overlap() -> TestResult {
    let op = operation(Duration::from_millis(10))?;
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let iterations = Arc::new(Mutex::new(Vec::new()));

    let (running_in, max_in, iterations_in) = (
        Arc::clone(&running),
        Arc::clone(&max_running),
        Arc::clone(&iterations),
    );
    op.start(
        move |tick: Tick| {
            let now_running = running_in.fetch_add(1, Ordering::SeqCst) + 1;
            max_in.fetch_max(now_running, Ordering::SeqCst);
            iterations_in.lock().push(tick.iteration);
            thread::sleep(Duration::from_millis(25));
            running_in.fetch_sub(1, Ordering::SeqCst);
        },
        Some(4),
    )?;

    assert!(op.wait_timeout(WAIT_LIMIT)?, "run did not finish");
    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    assert_eq!(*iterations.lock(), vec![0, 1, 2, 3]);

    let stats = op.stats();
    assert!(stats.skipped_expirations >= 1, "stats: {stats:?}");
    assert_eq!(stats.late_iterations, 4);
    Ok(())
}

#[test]
fn test_strict_timing_trips_on_overrun() -> TestResult {
    let config = OperationConfig::builder()
        .period(Duration::from_millis(10))
        .strict_timing(true)
        .build()?;
    let op = RecurringOperation::from_config_with_timer(&config, ThreadTimer::new())?;

    op.start(
        |_tick: Tick| thread::sleep(Duration::from_millis(40)),
        None,
    )?;

    let overrun = match op.wait() {
        Err(PschedError::Overrun(overrun)) => overrun,
        other => return Err(format!("expected an overrun, got {other:?}").into()),
    };

    assert!(overrun.ratio() >= 100.0, "ratio {}", overrun.ratio());
    assert!(overrun.is_genuine());
    assert_eq!(overrun.period(), Duration::from_millis(10));
    assert_eq!(overrun.iteration_count(), 0);
    assert!(!op.is_active());
    assert!(!op.is_locked());
    assert_eq!(op.overrun(), Some(overrun));
    assert_eq!(op.stats().overruns, 1);
    Ok(())
}

#[test]
fn test_restart_after_overrun_clears_snapshot() -> TestResult {
    let op = operation(Duration::from_millis(10))?;
    op.set_strict_timing(true);
    op.start(
        |_tick: Tick| thread::sleep(Duration::from_millis(40)),
        None,
    )?;
    assert!(op.wait().is_err());

    op.set_strict_timing(false);
    op.start(|_tick: Tick| (), Some(2))?;
    assert!(op.overrun().is_none());
    op.wait()?;
    assert_eq!(op.iteration_count(), 2);
    Ok(())
}

#[test]
fn test_stop_is_idempotent() -> TestResult {
    let op = operation(Duration::from_millis(5))?;
    op.stop();
    op.stop();

    op.start(|_tick: Tick| (), None)?;
    thread::sleep(Duration::from_millis(30));
    op.stop();
    op.stop();
    op.wait()?;

    let settled = op.iteration_count();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(op.iteration_count(), settled);
    assert!(!op.is_active());
    assert!(!op.is_locked());
    Ok(())
}

#[test]
fn test_stop_sentinel_ends_run() -> TestResult {
    let op = operation(Duration::from_millis(5))?;
    let (calls, seen) = counter();

    op.start(
        move |tick: Tick| {
            calls.fetch_add(1, Ordering::SeqCst);
            if tick.iteration == 1 {
                Control::Stop
            } else {
                Control::Continue
            }
        },
        None,
    )?;

    assert!(op.wait_timeout(WAIT_LIMIT)?, "run did not finish");
    thread::sleep(Duration::from_millis(30));
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(!op.is_active());
    Ok(())
}

#[test]
fn test_reschedule_while_active() -> TestResult {
    let op = operation(Duration::from_millis(500))?;
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let stamps_in = Arc::clone(&stamps);

    op.start(move |_tick: Tick| stamps_in.lock().push(Instant::now()), Some(4))?;
    let rescheduled = Instant::now();
    op.set_period(Duration::from_millis(30))?;
    assert_eq!(op.period(), Duration::from_millis(30));

    assert!(op.wait_timeout(WAIT_LIMIT)?, "run did not finish");
    let stamps = stamps.lock();
    assert_eq!(stamps.len(), 4);

    // One new period after the reschedule, not aligned to the old 500ms.
    let first = stamps
        .first()
        .ok_or("no invocation recorded")?
        .duration_since(rescheduled);
    assert!(first >= Duration::from_millis(30), "first invocation after {first:?}");
    assert!(first < Duration::from_millis(250), "first invocation after {first:?}");
    for pair in stamps.windows(2) {
        let [earlier, later] = pair else {
            return Err("windows(2) yielded a short slice".into());
        };
        let gap = later.duration_since(*earlier);
        assert!(gap >= Duration::from_millis(10), "gap {gap:?}");
        assert!(gap < Duration::from_millis(150), "gap {gap:?}");
    }
    Ok(())
}

#[test]
fn test_tick_reports_previous_tet_and_elapsed() -> TestResult {
    let op = operation(Duration::from_millis(20))?;
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let ticks_in = Arc::clone(&ticks);

    op.start(
        move |tick: Tick| {
            ticks_in.lock().push(tick);
            if tick.iteration == 0 {
                thread::sleep(Duration::from_millis(3));
            }
        },
        Some(2),
    )?;
    op.wait()?;

    let ticks = ticks.lock();
    let [first, second] = ticks.as_slice() else {
        return Err(format!("expected 2 ticks, got {}", ticks.len()).into());
    };
    assert_eq!(first.previous_tet, Duration::ZERO);
    assert!(second.previous_tet >= Duration::from_millis(3));
    assert!(second.elapsed > first.elapsed);
    assert!(first.elapsed >= Duration::from_millis(20));
    Ok(())
}

#[test]
fn test_start_time_is_recorded() -> TestResult {
    let op = operation(Duration::from_millis(5))?;
    let before = Instant::now();
    op.start(|_tick: Tick| (), Some(1))?;
    let after = Instant::now();

    let start_time = op.start_time().ok_or("start time missing")?;
    assert!(start_time >= before && start_time <= after);
    op.wait()?;
    Ok(())
}

#[test]
fn test_config_from_json() -> TestResult {
    let config: OperationConfig = serde_json::from_str(
        r#"{
            "period": { "secs": 0, "nanos": 5000000 },
            "strict_timing": false,
            "tet_history": 4
        }"#,
    )?;
    let op = RecurringOperation::from_config_with_timer(&config, ThreadTimer::new())?;
    op.start(|_tick: Tick| (), Some(6))?;
    op.wait()?;

    let stats = op.stats();
    assert_eq!(stats.total_iterations, 6);
    assert_eq!(stats.sample_count(), 4);
    Ok(())
}

#[test]
fn test_invalid_config_rejected() {
    let config = OperationConfig {
        period: Duration::ZERO,
        ..OperationConfig::default()
    };
    let result = RecurringOperation::from_config_with_timer(&config, ThreadTimer::new());
    assert!(matches!(result, Err(PschedError::InvalidConfiguration(_))));
}

#[test]
fn test_drop_stops_run() -> TestResult {
    let (calls, seen) = counter();
    {
        let op = operation(Duration::from_millis(5))?;
        op.start(
            move |_tick: Tick| {
                calls.fetch_add(1, Ordering::SeqCst);
            },
            None,
        )?;
        thread::sleep(Duration::from_millis(20));
    }

    thread::sleep(Duration::from_millis(20));
    let settled = seen.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(seen.load(Ordering::SeqCst), settled);
    Ok(())
}

/// Work that sleeps for `busy` and records the peak number of concurrent
/// invocations.
fn overlap_tracker(
    busy: Duration,
    running: &Arc<AtomicUsize>,
    peak: &Arc<AtomicUsize>,
) -> impl FnMut(Tick) + Send + 'static {
    let (running, peak) = (Arc::clone(running), Arc::clone(peak));
    move |_tick: Tick| {
        let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now_running, Ordering::SeqCst);
        thread::sleep(busy);
        running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn test_restart_waits_for_in_flight_invocation() -> TestResult {
    let op = operation(Duration::from_millis(5))?;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let busy = Duration::from_millis(100);

    op.start(overlap_tracker(busy, &running, &peak), None)?;
    thread::sleep(Duration::from_millis(20));
    op.stop();
    assert!(!op.is_active());

    // The first run's invocation is still sleeping.
    let early = op.start(overlap_tracker(busy, &running, &peak), None);
    assert!(
        matches!(early, Err(PschedError::InvalidArgument(_))),
        "restart during an invocation: {early:?}"
    );
    assert!(!op.is_active());

    op.wait()?;
    op.start(overlap_tracker(busy, &running, &peak), Some(2))?;
    assert!(op.wait_timeout(WAIT_LIMIT)?, "run did not finish");

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(op.iteration_count(), 2);
    Ok(())
}

#[test]
fn test_work_can_stop_its_own_operation() -> TestResult {
    let op = Arc::new(operation(Duration::from_millis(5))?);
    let handle: Weak<RecurringOperation> = Arc::downgrade(&op);
    let (calls, seen) = counter();

    op.start(
        move |tick: Tick| {
            calls.fetch_add(1, Ordering::SeqCst);
            if tick.iteration == 1
                && let Some(op) = handle.upgrade()
            {
                op.stop();
            }
        },
        None,
    )?;

    assert!(op.wait_timeout(WAIT_LIMIT)?, "run did not finish");
    thread::sleep(Duration::from_millis(30));
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(op.iteration_count(), 2);
    assert!(!op.is_active());
    assert!(!op.is_locked());
    Ok(())
}
