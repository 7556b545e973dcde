//! Timer capability consumed by the recurring-operation controller.
//!
//! A [`TimerSource`] owns a single repeating countdown and the channel its
//! expirations are delivered on. Arming uses microsecond units, matching the
//! interval-timer facility the default implementation wraps; `arm(0, 0)`
//! disarms.

use crate::error::TimerError;
use crossbeam::channel::Receiver;
use std::time::{Duration, Instant};

/// Result type for timer operations.
pub type TimerResult<T = ()> = Result<T, TimerError>;

/// One delivered timer expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration {
    /// When the expiration was observed (or, for timers that know it, when
    /// it was scheduled).
    pub at: Instant,
}

impl Expiration {
    /// Expiration observed now.
    #[must_use]
    pub fn now() -> Self {
        Self { at: Instant::now() }
    }
}

/// A repeating countdown that delivers asynchronous expiration notifications.
///
/// Implementations must make `disarm` and `uninstall` safe to call when the
/// timer was never armed or installed.
pub trait TimerSource: Send + 'static {
    /// Install the expiration handler and return the notification channel.
    ///
    /// The channel disconnects once [`uninstall`](Self::uninstall) runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be registered or the timer is
    /// already owned elsewhere.
    fn install(&mut self) -> TimerResult<Receiver<Expiration>>;

    /// Program the countdown: first expiration after `initial_delay_us`,
    /// then every `period_us`. `arm(0, 0)` disarms.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer cannot be programmed.
    fn arm(&mut self, initial_delay_us: u64, period_us: u64) -> TimerResult;

    /// Stop the countdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer cannot be programmed.
    fn disarm(&mut self) -> TimerResult {
        self.arm(0, 0)
    }

    /// Restore the default notification disposition and close the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the previous disposition cannot be restored.
    fn uninstall(&mut self) -> TimerResult;
}

impl TimerSource for Box<dyn TimerSource> {
    fn install(&mut self) -> TimerResult<Receiver<Expiration>> {
        (**self).install()
    }

    fn arm(&mut self, initial_delay_us: u64, period_us: u64) -> TimerResult {
        (**self).arm(initial_delay_us, period_us)
    }

    fn disarm(&mut self) -> TimerResult {
        (**self).disarm()
    }

    fn uninstall(&mut self) -> TimerResult {
        (**self).uninstall()
    }
}

/// Convert a period to whole microseconds for arming.
///
/// Truncates toward zero, but never maps a non-zero duration to `0`, which
/// would disarm the timer instead of arming it.
#[must_use]
pub fn duration_to_micros(duration: Duration) -> u64 {
    if duration.is_zero() {
        return 0;
    }
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX).max(1)
}
