use thiserror::Error;

use crate::deferred::DeferredState;

/// Errors raised by the primitives themselves (never by user tasks).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShuttleError {
    #[error("deferred value is not pending (state={0})")]
    InvalidState(DeferredState),

    #[error("retry failed after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why awaiting a deferred value did not produce a value.
///
/// `Rejected` carries the task's own failure unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeferredError<E> {
    #[error("{0}")]
    Rejected(E),

    #[error("deferred value timed out")]
    TimedOut,

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl<E> DeferredError<E> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, DeferredError::TimedOut)
    }
}
