//! Recurring operations driven by an OS interval timer.
//!
//! This crate runs a caller-supplied unit of work once per fixed period and
//! watches how long each invocation takes. It includes:
//!
//! - **RecurringOperation**: Start/stop/reschedule controller with overlap
//!   protection, an optional iteration bound and a stop sentinel
//! - **Strict timing**: Overruns become an [`OverrunError`] snapshot instead
//!   of being silently skipped
//! - **TetMetrics**: Task execution time tracking with percentile calculations
//! - **TimerSource**: `SIGALRM`/`setitimer` on unix, a timer thread elsewhere
//! - **Priority**: Best-effort process niceness requests
//!
//! # Guarantees
//!
//! - **No overlap**: at most one invocation runs at a time
//! - **No work in signal context**: the signal handler only wakes a thread
//! - **Idempotent stop**: `stop` may be called any number of times, from
//!   any thread, including from inside the work
//!
//! # Example
//!
//! ```no_run
//! use psched::{RecurringOperation, Tick};
//! use std::time::Duration;
//!
//! psched::request_max_priority();
//!
//! let op = RecurringOperation::new(Duration::from_millis(500))?;
//! op.start(
//!     |tick: Tick| println!("Ping {} (last TET {:?})", tick.iteration, tick.previous_tet),
//!     Some(10),
//! )?;
//! op.wait()?;
//! # Ok::<(), psched::PschedError>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::unwrap_used)]
#![deny(static_mut_refs)]
#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod operation;
pub mod overrun;
pub mod priority;
pub mod tet;
pub mod thread_timer;
pub mod timer;

#[cfg(unix)]
pub mod signal;

pub mod prelude;

pub use config::{OperationConfig, OperationConfigBuilder};
pub use error::{PschedError, PschedResult, TimerError};
pub use operation::{Control, DefaultTimer, RecurringOperation, Tick};
pub use overrun::OverrunError;
pub use priority::{PriorityOutcome, prioritize, request_max_priority};
pub use tet::TetMetrics;
pub use thread_timer::ThreadTimer;
pub use timer::{Expiration, TimerSource};

#[cfg(unix)]
pub use signal::SignalTimer;

/// Microseconds per second, the unit the interval timer is armed in.
pub const MICROS_PER_SECOND: u64 = 1_000_000;
