//! Recurring operation configuration.

use crate::error::{PschedError, PschedResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of TET samples retained for percentile queries.
pub const DEFAULT_TET_HISTORY: usize = 1_024;

/// Configuration for a [`RecurringOperation`](crate::RecurringOperation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Target time between invocation starts.
    pub period: Duration,
    /// Abort the run with an [`OverrunError`](crate::OverrunError) on overrun.
    pub strict_timing: bool,
    /// Number of recent TET samples kept for percentile calculation.
    pub tet_history: usize,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            strict_timing: false,
            tet_history: DEFAULT_TET_HISTORY,
        }
    }
}

impl OperationConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the period is zero. Periods below the timer's
    /// microsecond granularity are accepted and armed as 1µs.
    pub fn validate(&self) -> PschedResult<()> {
        if self.period.is_zero() {
            return Err(PschedError::invalid_configuration(
                "period must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> OperationConfigBuilder {
        OperationConfigBuilder::default()
    }
}

/// Builder for `OperationConfig`.
#[derive(Debug, Default)]
pub struct OperationConfigBuilder {
    config: OperationConfig,
}

impl OperationConfigBuilder {
    /// Set the period.
    #[must_use]
    pub fn period(mut self, period: Duration) -> Self {
        self.config.period = period;
        self
    }

    /// Set the period in seconds.
    ///
    /// Negative or non-finite values are mapped to a zero period, which
    /// `build()` rejects.
    #[must_use]
    pub fn period_secs(mut self, secs: f64) -> Self {
        self.config.period = Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO);
        self
    }

    /// Enable or disable strict timing.
    #[must_use]
    pub fn strict_timing(mut self, enabled: bool) -> Self {
        self.config.strict_timing = enabled;
        self
    }

    /// Set TET history capacity.
    #[must_use]
    pub fn tet_history(mut self, samples: usize) -> Self {
        self.config.tet_history = samples;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> PschedResult<OperationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
