//! Recurring operation controller.
//!
//! A [`RecurringOperation`] arms a repeating timer and invokes the caller's
//! work once per expiration, measuring each invocation's task execution time
//! (TET). Invocations never overlap: an expiration that arrives while the
//! previous invocation still holds the lock is an overrun, skipped silently
//! or, under strict timing, recorded as an [`OverrunError`] that ends the run.
//!
//! Expirations are consumed by a dispatcher thread that only touches the lock
//! flag; the work runs on a separate worker thread, so the dispatcher can see
//! an expiration while an invocation is in flight. No lock is ever held
//! across the work.

use crate::config::OperationConfig;
use crate::error::{PschedError, PschedResult, TimerError};
use crate::overrun::OverrunError;
use crate::tet::TetMetrics;
use crate::timer::{Expiration, TimerSource, duration_to_micros};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Timer used by [`RecurringOperation::new`] on this platform.
#[cfg(unix)]
pub type DefaultTimer = crate::signal::SignalTimer;

/// Timer used by [`RecurringOperation::new`] on this platform.
#[cfg(not(unix))]
pub type DefaultTimer = crate::thread_timer::ThreadTimer;

/// What the work asks for after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    /// Keep running.
    #[default]
    Continue,
    /// Stop the operation after this invocation.
    Stop,
}

impl From<()> for Control {
    fn from((): ()) -> Self {
        Self::Continue
    }
}

/// Arguments passed to each invocation of the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based index of this invocation.
    pub iteration: u64,
    /// Time since `start`.
    pub elapsed: Duration,
    /// TET of the previous invocation, zero on the first.
    pub previous_tet: Duration,
}

type Job = Box<dyn FnMut(Tick) -> Control + Send>;

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// State of one `start`..`stop` run.
struct Run {
    generation: u64,
    start_time: Instant,
    max_iterations: Option<u64>,
    locked: AtomicBool,
    stopped: AtomicBool,
    worker_done: AtomicBool,
    iteration_count: AtomicU64,
    tet_ns: AtomicU64,
    /// Offset from `start_time` of the expiration that dispatched the
    /// in-flight invocation.
    dispatched_ns: AtomicU64,
    overrun: Mutex<Option<OverrunError>>,
    metrics: Mutex<TetMetrics>,
}

impl Run {
    fn new(generation: u64, max_iterations: Option<u64>, tet_history: usize) -> Self {
        Self {
            generation,
            start_time: Instant::now(),
            max_iterations,
            locked: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            worker_done: AtomicBool::new(false),
            iteration_count: AtomicU64::new(0),
            tet_ns: AtomicU64::new(0),
            dispatched_ns: AtomicU64::new(0),
            overrun: Mutex::new(None),
            metrics: Mutex::new(TetMetrics::with_capacity(tet_history)),
        }
    }

    fn offset_ns(&self, at: Instant) -> u64 {
        duration_to_nanos(at.saturating_duration_since(self.start_time))
    }

    fn tet(&self) -> Duration {
        Duration::from_nanos(self.tet_ns.load(Ordering::Acquire))
    }
}

struct ControlState {
    timer: Box<dyn TimerSource>,
    generation: u64,
    run: Option<Arc<Run>>,
}

struct Shared {
    period_ns: AtomicU64,
    strict_timing: AtomicBool,
    active: AtomicBool,
    tet_history: usize,
    control: Mutex<ControlState>,
    finished: Condvar,
}

impl Shared {
    fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns.load(Ordering::Acquire))
    }

    /// Disarm, restore the handler and clear `active` and `locked`.
    ///
    /// With `Some(generation)` only that run is stopped, so a stale worker
    /// can never stop a later run.
    fn stop_run(&self, generation: Option<u64>) {
        let mut control = self.control.lock();
        if generation.is_some_and(|generation| generation != control.generation) {
            return;
        }

        if let Err(err) = control.timer.disarm() {
            tracing::warn!(error = %err, "Failed to disarm timer");
        }
        if let Err(err) = control.timer.uninstall() {
            tracing::warn!(error = %err, "Failed to restore notification handler");
        }

        let was_active = self.active.swap(false, Ordering::SeqCst);
        if let Some(run) = &control.run {
            run.stopped.store(true, Ordering::SeqCst);
            run.locked.store(false, Ordering::SeqCst);
            if was_active {
                tracing::info!(
                    iterations = run.iteration_count.load(Ordering::Acquire),
                    "Recurring operation stopped"
                );
            }
        }
        self.finished.notify_all();
    }

    fn arm(&self, control: &mut ControlState, period: Duration) -> PschedResult<()> {
        let period_us = duration_to_micros(period);
        control.timer.arm(period_us, period_us)?;
        Ok(())
    }
}

/// Periodic executor driven by an OS interval timer.
///
/// # Example
///
/// ```no_run
/// use psched::{Control, RecurringOperation, Tick};
/// use std::time::Duration;
///
/// let op = RecurringOperation::new(Duration::from_millis(500))?;
/// op.start(
///     |tick: Tick| {
///         println!("Ping {}: {:?}", tick.iteration, tick.elapsed);
///         Control::Continue
///     },
///     Some(10),
/// )?;
/// op.wait()?;
/// # Ok::<(), psched::PschedError>(())
/// ```
pub struct RecurringOperation {
    shared: Arc<Shared>,
}

impl fmt::Debug for RecurringOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringOperation")
            .field("period", &self.period())
            .field("active", &self.is_active())
            .field("strict_timing", &self.strict_timing())
            .field("iteration_count", &self.iteration_count())
            .field("tet", &self.tet())
            .finish_non_exhaustive()
    }
}

impl RecurringOperation {
    /// Create an operation on the platform's default timer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `period` is zero.
    pub fn new(period: Duration) -> PschedResult<Self> {
        Self::with_timer(period, DefaultTimer::new())
    }

    /// Create an operation from a period in seconds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `secs` is not a positive finite number.
    pub fn from_secs_f64(secs: f64) -> PschedResult<Self> {
        let period = Duration::try_from_secs_f64(secs)
            .map_err(|err| PschedError::invalid_argument(format!("period {secs}s: {err}")))?;
        Self::new(period)
    }

    /// Create an operation driven by a specific timer source.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `period` is zero.
    pub fn with_timer(period: Duration, timer: impl TimerSource) -> PschedResult<Self> {
        Self::build(period, false, crate::config::DEFAULT_TET_HISTORY, Box::new(timer))
    }

    /// Create an operation from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config(config: &OperationConfig) -> PschedResult<Self> {
        Self::from_config_with_timer(config, DefaultTimer::new())
    }

    /// Create an operation from a configuration and a specific timer source.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config_with_timer(
        config: &OperationConfig,
        timer: impl TimerSource,
    ) -> PschedResult<Self> {
        config.validate()?;
        Self::build(
            config.period,
            config.strict_timing,
            config.tet_history,
            Box::new(timer),
        )
    }

    fn build(
        period: Duration,
        strict_timing: bool,
        tet_history: usize,
        timer: Box<dyn TimerSource>,
    ) -> PschedResult<Self> {
        validate_period(period)?;
        Ok(Self {
            shared: Arc::new(Shared {
                period_ns: AtomicU64::new(duration_to_nanos(period)),
                strict_timing: AtomicBool::new(strict_timing),
                active: AtomicBool::new(false),
                tet_history,
                control: Mutex::new(ControlState {
                    timer,
                    generation: 0,
                    run: None,
                }),
                finished: Condvar::new(),
            }),
        })
    }

    /// Start invoking `work` once per period.
    ///
    /// The first invocation happens after the first expiration, one period
    /// from now. The operation stops itself once `max_iterations`
    /// invocations have completed or the work returns [`Control::Stop`].
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `max_iterations` is `Some(0)`, the operation
    ///   is already active, or an invocation from a stopped run has not
    ///   returned yet (see [`wait`](Self::wait)).
    /// - `Timer` if the handler cannot be installed or the timer armed.
    pub fn start<F, R>(&self, mut work: F, max_iterations: Option<u64>) -> PschedResult<()>
    where
        F: FnMut(Tick) -> R + Send + 'static,
        R: Into<Control>,
    {
        if max_iterations == Some(0) {
            return Err(PschedError::invalid_argument(
                "max_iterations must be greater than 0",
            ));
        }

        let mut control = self.shared.control.lock();
        if self.shared.active.load(Ordering::Acquire) {
            return Err(PschedError::invalid_argument(
                "operation is already active",
            ));
        }
        // A stopped run's in-flight invocation must return before new work
        // may start, or the two would overlap.
        if control
            .run
            .as_ref()
            .is_some_and(|run| !run.worker_done.load(Ordering::Acquire))
        {
            return Err(PschedError::invalid_argument(
                "previous invocation is still running",
            ));
        }

        let period = self.shared.period();
        let expirations = control.timer.install()?;

        control.generation = control.generation.wrapping_add(1);
        let run = Arc::new(Run::new(
            control.generation,
            max_iterations,
            self.shared.tet_history,
        ));
        control.run = Some(Arc::clone(&run));

        let (job_tx, job_rx) = channel::bounded::<Expiration>(1);
        let job: Job = Box::new(move |tick| work(tick).into());

        let spawned = spawn_worker(&self.shared, &run, job_rx, job)
            .and_then(|()| spawn_dispatcher(&self.shared, &run, expirations, job_tx));
        if let Err(err) = spawned {
            run.stopped.store(true, Ordering::SeqCst);
            run.worker_done.store(true, Ordering::Release);
            if let Err(uninstall_err) = control.timer.uninstall() {
                tracing::warn!(error = %uninstall_err, "Failed to restore notification handler");
            }
            return Err(err.into());
        }

        self.shared.active.store(true, Ordering::SeqCst);
        if let Err(err) = self.shared.arm(&mut control, period) {
            self.shared.active.store(false, Ordering::SeqCst);
            run.stopped.store(true, Ordering::SeqCst);
            if let Err(uninstall_err) = control.timer.uninstall() {
                tracing::warn!(error = %uninstall_err, "Failed to restore notification handler");
            }
            return Err(err);
        }

        tracing::info!(
            period_us = duration_to_micros(period),
            max_iterations = ?max_iterations,
            strict_timing = self.strict_timing(),
            "Recurring operation started"
        );
        Ok(())
    }

    /// Stop the operation: disarm the timer, restore the notification
    /// handler and clear `active` and `locked`.
    ///
    /// An invocation already running finishes on its own; no new one starts.
    /// Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        self.shared.stop_run(None);
    }

    /// Change the period. While active the timer is re-armed immediately, so
    /// the next expiration is one new period from now.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `period` is zero, or `Timer` if re-arming
    /// fails.
    pub fn set_period(&self, period: Duration) -> PschedResult<()> {
        validate_period(period)?;
        let mut control = self.shared.control.lock();
        self.shared
            .period_ns
            .store(duration_to_nanos(period), Ordering::Release);

        if self.shared.active.load(Ordering::Acquire) {
            self.shared.arm(&mut control, period)?;
            tracing::debug!(period_us = duration_to_micros(period), "Rescheduled");
        }
        Ok(())
    }

    /// Re-arm the timer with the current period. No-op while inactive.
    ///
    /// # Errors
    ///
    /// Returns `Timer` if re-arming fails.
    pub fn schedule(&self) -> PschedResult<()> {
        let mut control = self.shared.control.lock();
        if self.shared.active.load(Ordering::Acquire) {
            self.shared.arm(&mut control, self.shared.period())?;
        }
        Ok(())
    }

    /// Block until the run has stopped and its last invocation has returned.
    ///
    /// Must not be called from inside the work.
    ///
    /// # Errors
    ///
    /// Returns `Overrun` if strict timing ended the run.
    pub fn wait(&self) -> PschedResult<()> {
        let mut control = self.shared.control.lock();
        loop {
            let Some(run) = control.run.clone() else {
                return Ok(());
            };
            if self.run_finished(&run) {
                return overrun_result(&run);
            }
            self.shared.finished.wait(&mut control);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns `Ok(true)` if the run finished, `Ok(false)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns `Overrun` if strict timing ended the run.
    pub fn wait_timeout(&self, timeout: Duration) -> PschedResult<bool> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.wait().map(|()| true);
        };
        let mut control = self.shared.control.lock();
        loop {
            let Some(run) = control.run.clone() else {
                return Ok(true);
            };
            if self.run_finished(&run) {
                return overrun_result(&run).map(|()| true);
            }
            if self
                .shared
                .finished
                .wait_until(&mut control, deadline)
                .timed_out()
            {
                let run = control.run.clone();
                return match run {
                    Some(run) if self.run_finished(&run) => overrun_result(&run).map(|()| true),
                    Some(_) => Ok(false),
                    None => Ok(true),
                };
            }
        }
    }

    fn run_finished(&self, run: &Run) -> bool {
        !self.shared.active.load(Ordering::Acquire) && run.worker_done.load(Ordering::Acquire)
    }

    fn current_run(&self) -> Option<Arc<Run>> {
        self.shared.control.lock().run.clone()
    }

    /// Whether a timer is armed; poll this (or call [`wait`](Self::wait)) to
    /// keep the process alive while the operation runs.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Whether an invocation currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.current_run()
            .is_some_and(|run| run.locked.load(Ordering::Acquire))
    }

    /// Current period.
    #[inline]
    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    /// TET of the most recently completed invocation.
    pub fn tet(&self) -> Duration {
        self.current_run().map_or(Duration::ZERO, |run| run.tet())
    }

    /// Completed invocations in the current (or last) run.
    pub fn iteration_count(&self) -> u64 {
        self.current_run()
            .map_or(0, |run| run.iteration_count.load(Ordering::Acquire))
    }

    /// When the current (or last) run started.
    pub fn start_time(&self) -> Option<Instant> {
        self.current_run().map(|run| run.start_time)
    }

    /// Whether overruns abort the run.
    #[inline]
    pub fn strict_timing(&self) -> bool {
        self.shared.strict_timing.load(Ordering::Acquire)
    }

    /// Enable or disable strict timing; takes effect at the next expiration.
    pub fn set_strict_timing(&self, enabled: bool) {
        self.shared.strict_timing.store(enabled, Ordering::Release);
    }

    /// Overrun that ended the current (or last) run, if any.
    pub fn overrun(&self) -> Option<OverrunError> {
        self.current_run().and_then(|run| *run.overrun.lock())
    }

    /// Expirations skipped because an invocation was still running.
    pub fn skipped_expirations(&self) -> u64 {
        self.current_run()
            .map_or(0, |run| run.metrics.lock().skipped_expirations)
    }

    /// Snapshot of the TET metrics for the current (or last) run.
    pub fn stats(&self) -> TetMetrics {
        self.current_run().map_or_else(
            || TetMetrics::with_capacity(self.shared.tet_history),
            |run| run.metrics.lock().clone(),
        )
    }
}

impl Drop for RecurringOperation {
    fn drop(&mut self) {
        self.stop();
    }
}

fn validate_period(period: Duration) -> PschedResult<()> {
    if period.is_zero() {
        return Err(PschedError::invalid_argument("period must be greater than 0"));
    }
    Ok(())
}

fn overrun_result(run: &Run) -> PschedResult<()> {
    match *run.overrun.lock() {
        Some(overrun) => Err(PschedError::Overrun(overrun)),
        None => Ok(()),
    }
}

fn spawn_error(source: std::io::Error) -> TimerError {
    TimerError::Os {
        call: "thread spawn",
        source,
    }
}

fn spawn_worker(
    shared: &Arc<Shared>,
    run: &Arc<Run>,
    jobs: Receiver<Expiration>,
    mut job: Job,
) -> Result<(), TimerError> {
    let shared = Arc::clone(shared);
    let run = Arc::clone(run);
    thread::Builder::new()
        .name("psched-worker".into())
        .spawn(move || {
            run_worker(&shared, &run, &jobs, &mut job);
            run.worker_done.store(true, Ordering::Release);
            let _control = shared.control.lock();
            shared.finished.notify_all();
        })
        .map(drop)
        .map_err(spawn_error)
}

fn spawn_dispatcher(
    shared: &Arc<Shared>,
    run: &Arc<Run>,
    expirations: Receiver<Expiration>,
    jobs: Sender<Expiration>,
) -> Result<(), TimerError> {
    let shared = Arc::clone(shared);
    let run = Arc::clone(run);
    thread::Builder::new()
        .name("psched-dispatch".into())
        .spawn(move || dispatch(&shared, &run, &expirations, &jobs))
        .map(drop)
        .map_err(spawn_error)
}

/// Step logic, expiration side: take the lock and hand off, or handle the
/// overrun.
fn dispatch(
    shared: &Shared,
    run: &Run,
    expirations: &Receiver<Expiration>,
    jobs: &Sender<Expiration>,
) {
    for expiration in expirations {
        if run.stopped.load(Ordering::SeqCst) {
            return;
        }

        if run
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // stop() may have cleared the lock mid-invocation.
            if run.stopped.load(Ordering::SeqCst) {
                return;
            }
            run.dispatched_ns
                .store(run.offset_ns(expiration.at), Ordering::Release);
            if jobs.send(expiration).is_err() {
                return;
            }
            continue;
        }

        let iteration = run.iteration_count.load(Ordering::Acquire);
        if !shared.strict_timing.load(Ordering::Acquire) {
            run.metrics.lock().record_skipped();
            tracing::debug!(iteration, "Expiration skipped: previous invocation still running");
            continue;
        }

        run.locked.store(false, Ordering::SeqCst);
        let in_flight_ns = run
            .offset_ns(expiration.at)
            .saturating_sub(run.dispatched_ns.load(Ordering::Acquire));
        let overrun = OverrunError::new(
            Duration::from_nanos(in_flight_ns),
            shared.period(),
            iteration,
            SystemTime::now(),
        );
        tracing::error!(
            iteration,
            tet_us = overrun.tet().as_micros(),
            period_us = overrun.period().as_micros(),
            ratio = overrun.ratio(),
            "Real-time overrun under strict timing"
        );
        run.metrics.lock().record_overrun();
        *run.overrun.lock() = Some(overrun);
        shared.stop_run(Some(run.generation));
        return;
    }
}

/// Step logic, invocation side.
fn run_worker(shared: &Shared, run: &Run, jobs: &Receiver<Expiration>, job: &mut Job) {
    for _expiration in jobs {
        if run.stopped.load(Ordering::SeqCst) {
            run.locked.store(false, Ordering::SeqCst);
            return;
        }

        let step_start = Instant::now();
        let tick = Tick {
            iteration: run.iteration_count.load(Ordering::Acquire),
            elapsed: step_start.saturating_duration_since(run.start_time),
            previous_tet: run.tet(),
        };

        let control = job(tick);

        let completed = run
            .iteration_count
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        if run.max_iterations.is_some_and(|max| completed >= max) {
            shared.stop_run(Some(run.generation));
        }
        if control == Control::Stop {
            shared.stop_run(Some(run.generation));
        }

        // TET is recorded after any self-stop so it is final once the run
        // reports finished; the lock is released last.
        let tet = step_start.elapsed();
        run.tet_ns.store(duration_to_nanos(tet), Ordering::Release);
        run.metrics.lock().record_iteration(tet, shared.period());
        run.locked.store(false, Ordering::SeqCst);
    }
}
