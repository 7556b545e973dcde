//! Best-effort process priority requests.
//!
//! Raising priority only improves how reliably periods are honored; failure
//! (usually missing privileges) is reported and never fatal.

/// Most favorable niceness on unix.
pub const MAX_PRIORITY_NICE: i32 = -20;

/// Least favorable niceness on unix.
pub const MIN_PRIORITY_NICE: i32 = 19;

/// Outcome of a priority request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityOutcome {
    /// The new niceness was applied.
    Success,
    /// The OS refused the request.
    Failure {
        /// Raw OS error code.
        errno: i32,
    },
    /// The platform has no process niceness.
    Unsupported,
}

impl PriorityOutcome {
    /// Check whether the request succeeded.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Operator-facing message.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure (missing privileges?)",
            Self::Unsupported => "unsupported on this platform",
        }
    }
}

/// Set the niceness of the current process, clamped to
/// `MAX_PRIORITY_NICE..=MIN_PRIORITY_NICE`.
pub fn prioritize(nice: i32) -> PriorityOutcome {
    let nice = clamp_nice(nice);
    let outcome = platform::set_nice(nice);

    if outcome.is_success() {
        tracing::info!(nice, "Setting process priority: {}", outcome.message());
    } else {
        tracing::warn!(nice, ?outcome, "Setting process priority: {}", outcome.message());
    }
    outcome
}

fn clamp_nice(nice: i32) -> i32 {
    nice.clamp(MAX_PRIORITY_NICE, MIN_PRIORITY_NICE)
}

/// Request the most favorable scheduling priority. Returns `true` on success.
pub fn request_max_priority() -> bool {
    prioritize(MAX_PRIORITY_NICE).is_success()
}

#[cfg(unix)]
mod platform {
    #![expect(unsafe_code, reason = "setpriority FFI")]

    use super::PriorityOutcome;

    pub(super) fn set_nice(nice: i32) -> PriorityOutcome {
        // SAFETY: setpriority(2) takes plain integers; `who = 0` is the caller.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
        if rc == 0 {
            PriorityOutcome::Success
        } else {
            PriorityOutcome::Failure {
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            }
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use super::PriorityOutcome;

    pub(super) fn set_nice(_nice: i32) -> PriorityOutcome {
        PriorityOutcome::Unsupported
    }
}
