//! Task execution time (TET) metrics.
//!
//! Tracks how much of each period the user's work consumed, how many
//! invocations ran late, and how many expirations were skipped because an
//! invocation was still in flight.

use std::time::Duration;
use std::vec::Vec;

/// TET metrics collection and analysis.
///
/// # RT-Safety
///
/// - `record_iteration` is O(1) amortized
/// - Uses a bounded ring buffer for samples
/// - Reuses scratch storage for percentile calculation
#[derive(Debug, Clone)]
pub struct TetMetrics {
    /// Completed invocations recorded
    pub total_iterations: u64,

    /// Invocations whose TET met or exceeded the period
    pub late_iterations: u64,

    /// Expirations skipped because the previous invocation held the lock
    pub skipped_expirations: u64,

    /// Overruns reported under strict timing
    pub overruns: u64,

    /// Maximum observed TET in nanoseconds
    pub max_tet_ns: u64,

    /// Most recent TET in nanoseconds
    pub last_tet_ns: u64,

    /// Sum of all recorded TETs, for the mean
    tet_sum_ns: u128,

    /// Recent TET samples for percentile calculation (ring buffer)
    recent_samples: Vec<u64>,

    /// Maximum samples to keep
    max_samples: usize,

    /// Ring buffer write index
    next_sample_index: usize,

    /// Reused scratch storage for percentile selection
    percentile_scratch: Vec<u64>,
}

impl Default for TetMetrics {
    fn default() -> Self {
        Self::with_capacity(crate::config::DEFAULT_TET_HISTORY)
    }
}

impl TetMetrics {
    /// Create TET metrics with default capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create TET metrics retaining at most `max_samples` recent samples.
    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            total_iterations: 0,
            late_iterations: 0,
            skipped_expirations: 0,
            overruns: 0,
            max_tet_ns: 0,
            last_tet_ns: 0,
            tet_sum_ns: 0,
            recent_samples: Vec::with_capacity(max_samples),
            max_samples,
            next_sample_index: 0,
            percentile_scratch: Vec::with_capacity(max_samples),
        }
    }

    /// Record one completed invocation.
    pub fn record_iteration(&mut self, tet: Duration, period: Duration) {
        let tet_ns = u64::try_from(tet.as_nanos()).unwrap_or(u64::MAX);

        self.total_iterations = self.total_iterations.saturating_add(1);
        if tet >= period {
            self.late_iterations = self.late_iterations.saturating_add(1);
        }
        self.max_tet_ns = self.max_tet_ns.max(tet_ns);
        self.last_tet_ns = tet_ns;
        self.tet_sum_ns = self.tet_sum_ns.saturating_add(u128::from(tet_ns));

        if self.max_samples == 0 {
            return;
        }

        if self.recent_samples.len() < self.max_samples {
            self.recent_samples.push(tet_ns);
            if self.recent_samples.len() == self.max_samples {
                self.next_sample_index = 0;
            }
        } else if let Some(slot) = self.recent_samples.get_mut(self.next_sample_index) {
            *slot = tet_ns;
            self.next_sample_index = (self.next_sample_index + 1) % self.max_samples;
        }
    }

    /// Record an expiration that was skipped because an invocation was in flight.
    pub fn record_skipped(&mut self) {
        self.skipped_expirations = self.skipped_expirations.saturating_add(1);
    }

    /// Record a strict-timing overrun.
    pub fn record_overrun(&mut self) {
        self.overruns = self.overruns.saturating_add(1);
    }

    /// p99 TET in nanoseconds.
    pub fn p99_tet_ns(&mut self) -> u64 {
        self.percentile_tet_ns(0.99)
    }

    /// p95 TET in nanoseconds.
    pub fn p95_tet_ns(&mut self) -> u64 {
        self.percentile_tet_ns(0.95)
    }

    /// Median TET in nanoseconds.
    pub fn p50_tet_ns(&mut self) -> u64 {
        self.percentile_tet_ns(0.50)
    }

    /// Arbitrary percentile (0.0 to 1.0) of recent TET samples.
    ///
    /// Returns 0 if no samples have been recorded.
    pub fn percentile_tet_ns(&mut self, percentile: f64) -> u64 {
        if self.recent_samples.is_empty() {
            return 0;
        }

        let percentile = percentile.clamp(0.0, 1.0);

        self.percentile_scratch.clear();
        self.percentile_scratch.extend_from_slice(&self.recent_samples);

        let len = self.percentile_scratch.len();
        let index = ((len as f64 * percentile) as usize).min(len.saturating_sub(1));
        let (_, value, _) = self.percentile_scratch.select_nth_unstable(index);
        *value
    }

    /// Mean TET over all recorded invocations.
    pub fn mean_tet(&self) -> Duration {
        if self.total_iterations == 0 {
            return Duration::ZERO;
        }
        let mean = self.tet_sum_ns / u128::from(self.total_iterations);
        Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
    }

    /// Maximum observed TET.
    pub fn max_tet(&self) -> Duration {
        Duration::from_nanos(self.max_tet_ns)
    }

    /// Fraction of invocations (0.0 to 1.0) that consumed a whole period.
    pub fn late_rate(&self) -> f64 {
        if self.total_iterations == 0 {
            0.0
        } else {
            self.late_iterations as f64 / self.total_iterations as f64
        }
    }

    /// Worst-case utilization of the period as a percentage.
    pub fn peak_utilization(&self, period: Duration) -> f64 {
        let period = period.as_secs_f64();
        if period <= 0.0 {
            return 0.0;
        }
        self.max_tet().as_secs_f64() / period * 100.0
    }

    /// Check that no invocation ran late and no expiration was skipped.
    pub fn within_budget(&self) -> bool {
        self.late_iterations == 0 && self.skipped_expirations == 0 && self.overruns == 0
    }

    /// Number of samples currently stored.
    pub fn sample_count(&self) -> usize {
        self.recent_samples.len()
    }

    /// Reset all metrics.
    pub fn reset(&mut self) {
        self.total_iterations = 0;
        self.late_iterations = 0;
        self.skipped_expirations = 0;
        self.overruns = 0;
        self.max_tet_ns = 0;
        self.last_tet_ns = 0;
        self.tet_sum_ns = 0;
        self.recent_samples.clear();
        self.next_sample_index = 0;
        self.percentile_scratch.clear();
    }
}
