//! Deferred value state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Settlement state of a deferred value.
///
/// State transitions:
/// - Pending -> Resolved
/// - Pending -> Rejected
/// - Pending -> TimedOut (timer fired before settlement)
///
/// Every non-pending state is terminal. A second transition attempt is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredState {
    /// Not settled yet.
    Pending,

    /// Settled with a value.
    Resolved,

    /// Settled with a cause (task failure or panic).
    Rejected,

    /// The armed timer fired first.
    TimedOut,
}

impl DeferredState {
    pub fn is_pending(self) -> bool {
        matches!(self, DeferredState::Pending)
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeferredState::Pending => "pending",
            DeferredState::Resolved => "resolved",
            DeferredState::Rejected => "rejected",
            DeferredState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for DeferredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
