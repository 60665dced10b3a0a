//! Identifiers used to correlate log lines of one submitted task.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// TaskId identifies one submission to a keyed executor or latest-wins scheduler.
///
/// ULID なので生成順にソートできる（ログを時系列で追いやすい）。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}
