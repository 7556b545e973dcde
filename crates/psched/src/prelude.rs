//! Prelude module for common psched types.
//!
//! This module provides a convenient way to import the most commonly used
//! types from the psched crate.

pub use crate::config::{OperationConfig, OperationConfigBuilder};
pub use crate::error::{PschedError, PschedResult, TimerError};
pub use crate::operation::{Control, RecurringOperation, Tick};
pub use crate::overrun::OverrunError;
pub use crate::priority::{prioritize, request_max_priority};
pub use crate::tet::TetMetrics;
pub use crate::timer::TimerSource;
