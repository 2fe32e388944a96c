//! Task state machine for the queue.

use serde::{Deserialize, Serialize};

/// Task state inside the queue.
///
/// State transitions:
/// - Pending -> Leased -> (removed on done)
/// - Pending -> Leased -> Pending (lease expired, requeued)
/// - Pending -> (removed on cancel)
///
/// A task that is done or cancelled while pending has no state: it is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a matching poller.
    Pending,

    /// Owned by exactly one poller until its lease expires or it is done.
    Leased,
}

impl TaskState {
    /// Is this task eligible for a poll?
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Pending)
    }
}
