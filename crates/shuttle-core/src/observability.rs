use serde::{Deserialize, Serialize};

/// Snapshot of a keyed executor's queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Keys with at least one unfinished task.
    pub keys: usize,
    /// Tasks waiting behind their key's head.
    pub queued: usize,
    /// Heads currently executing (one per key at most).
    pub running: usize,
}
