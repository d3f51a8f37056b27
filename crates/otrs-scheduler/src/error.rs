//! Scheduler error types.

use thiserror::Error;

/// Errors from registering or stopping collector loops.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("collector already scheduled: {0}")]
    AlreadyScheduled(String),

    #[error("shutdown grace period exceeded, aborted: {}", .0.join(", "))]
    GraceExceeded(Vec<String>),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
