//! Diagnostic snapshot produced when strict timing trips.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Snapshot of an overrun: an expiration arrived while the previous
/// invocation still held the lock.
///
/// `tet` is the time the offending invocation had consumed when the
/// expiration arrived, so `ratio() >= 100` marks a genuine overrun and values
/// just under 100 a near-miss caught by notification latency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverrunError {
    tet: Duration,
    period: Duration,
    iteration_count: u64,
    timestamp: SystemTime,
}

impl OverrunError {
    /// Create a new snapshot.
    #[must_use]
    pub fn new(
        tet: Duration,
        period: Duration,
        iteration_count: u64,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            tet,
            period,
            iteration_count,
            timestamp,
        }
    }

    /// Execution time consumed by the offending invocation.
    #[inline]
    #[must_use]
    pub fn tet(&self) -> Duration {
        self.tet
    }

    /// Configured period at the time of the overrun.
    #[inline]
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Completed invocations when the overrun was detected.
    #[inline]
    #[must_use]
    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    /// Wall-clock time of the offending expiration.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Percentage of the period consumed: `tet / period * 100`.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        let period = self.period.as_secs_f64();
        if period <= 0.0 {
            return f64::INFINITY;
        }
        self.tet.as_secs_f64() / period * 100.0
    }

    /// True when the invocation consumed at least the whole period.
    #[must_use]
    pub fn is_genuine(&self) -> bool {
        self.tet >= self.period
    }
}

impl fmt::Display for OverrunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Real-time overrun at iteration {}: TET {:?} vs period {:?} ({:.1}%)",
            self.iteration_count,
            self.tet,
            self.period,
            self.ratio()
        )
    }
}

impl std::error::Error for OverrunError {}
