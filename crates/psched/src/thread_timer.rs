//! Portable timer source driven by a dedicated thread.
//!
//! Used on platforms without the unix interval timer, and wherever more
//! than one recurring operation must run in the same process (tests, for
//! instance), since it owns no process-wide state.

use crate::error::TimerError;
use crate::timer::{Expiration, TimerResult, TimerSource};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum Command {
    Arm { delay: Duration, period: Duration },
}

/// Repeating countdown backed by a timer thread.
///
/// Expirations carry their scheduled deadline. When the thread wakes more
/// than one period late the missed expirations are coalesced into one, the
/// same way an OS interval timer collapses pending signals.
#[derive(Debug, Default)]
pub struct ThreadTimer {
    control: Option<Sender<Command>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadTimer {
    /// Create an uninstalled timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the timer thread is running.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.control.is_some()
    }
}

impl TimerSource for ThreadTimer {
    fn install(&mut self) -> TimerResult<Receiver<Expiration>> {
        self.uninstall()?;

        let (control_tx, control_rx) = channel::unbounded();
        let (expiration_tx, expiration_rx) = channel::unbounded();

        let handle = thread::Builder::new()
            .name("psched-timer".into())
            .spawn(move || run_countdown(&control_rx, &expiration_tx))
            .map_err(|source| TimerError::Os {
                call: "thread spawn",
                source,
            })?;

        self.control = Some(control_tx);
        self.handle = Some(handle);
        Ok(expiration_rx)
    }

    fn arm(&mut self, initial_delay_us: u64, period_us: u64) -> TimerResult {
        let control = self.control.as_ref().ok_or(TimerError::NotInstalled)?;
        control
            .send(Command::Arm {
                delay: Duration::from_micros(initial_delay_us),
                period: Duration::from_micros(period_us),
            })
            .map_err(|_closed| TimerError::ChannelClosed)
    }

    fn disarm(&mut self) -> TimerResult {
        match self.arm(0, 0) {
            Err(TimerError::NotInstalled) => Ok(()),
            other => other,
        }
    }

    fn uninstall(&mut self) -> TimerResult {
        // Dropping the control sender ends the countdown thread, which in
        // turn disconnects the expiration channel.
        self.control = None;
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            tracing::warn!("Timer thread panicked before shutdown");
        }
        Ok(())
    }
}

fn run_countdown(control: &Receiver<Command>, expirations: &Sender<Expiration>) {
    let mut next: Option<(Instant, Duration)> = None;

    loop {
        let command = match next {
            None => match control.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            },
            Some((deadline, _)) => match control.recv_deadline(deadline) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
        };

        match command {
            Some(Command::Arm { delay, period }) => {
                next = if delay.is_zero() {
                    None
                } else {
                    Some((Instant::now() + delay, period))
                };
            }
            None => {
                let Some((deadline, period)) = next else {
                    continue;
                };
                if expirations.send(Expiration { at: deadline }).is_err() {
                    return;
                }
                next = following_deadline(deadline, period, Instant::now()).map(|d| (d, period));
            }
        }
    }
}

/// Next deadline after `deadline`, skipping any that have already passed.
fn following_deadline(deadline: Instant, period: Duration, now: Instant) -> Option<Instant> {
    if period.is_zero() {
        return None;
    }
    let mut following = deadline + period;
    while following <= now {
        following += period;
    }
    Some(following)
}
