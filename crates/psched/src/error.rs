//! Error types for the psched crate.

use crate::overrun::OverrunError;
use thiserror::Error;

/// Errors raised by a [`TimerSource`](crate::timer::TimerSource).
#[derive(Debug, Error)]
pub enum TimerError {
    /// The process-wide timer is already owned by another operation.
    #[error("Interval timer is already owned by another recurring operation")]
    Busy,

    /// The timer was armed before its notification handler was installed.
    #[error("Timer notification handler is not installed")]
    NotInstalled,

    /// A system call backing the timer failed.
    #[error("{call} failed: {source}")]
    Os {
        /// Name of the failing call.
        call: &'static str,
        /// The OS error reported by the call.
        #[source]
        source: std::io::Error,
    },

    /// The internal control or notification channel was closed.
    #[error("Timer channel closed")]
    ChannelClosed,
}

impl TimerError {
    /// Capture `errno` for a failed system call.
    #[must_use]
    pub fn last_os_error(call: &'static str) -> Self {
        Self::Os {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Errors that can occur while driving a recurring operation.
#[derive(Debug, Error)]
pub enum PschedError {
    /// A caller-supplied argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An invocation was still running when the next expiration arrived
    /// while strict timing was enabled.
    #[error(transparent)]
    Overrun(#[from] OverrunError),

    /// The timer facility could not be armed or its handler installed.
    #[error("Timer failure: {0}")]
    Timer(#[from] TimerError),
}

impl PschedError {
    /// Create an invalid argument error.
    #[must_use]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration(reason.into())
    }

    /// Returns the overrun snapshot if this error is a strict-timing trip.
    #[must_use]
    pub fn as_overrun(&self) -> Option<&OverrunError> {
        match self {
            Self::Overrun(overrun) => Some(overrun),
            _ => None,
        }
    }
}

/// A specialized `Result` type for psched operations.
pub type PschedResult<T = ()> = std::result::Result<T, PschedError>;
