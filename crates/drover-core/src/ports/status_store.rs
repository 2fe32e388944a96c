//! StatusStore port: server-side record of agent reports.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionState, LogArtifact, TaskId};
use crate::error::StoreError;

/// Everything reported for one task so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task-level state from `init` and `done`.
    pub state: ExecutionState,

    /// Per-step states from `update`, keyed by step alias.
    pub steps: BTreeMap<String, ExecutionState>,

    /// Uploaded files, in arrival order.
    pub artifacts: Vec<LogArtifact>,
}

/// Persists the status an agent reports for the task it holds.
///
/// Only the lease holder writes a task's status, so implementations do not
/// arbitrate between writers. They must tolerate out-of-order `update`s.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn init(&self, id: &TaskId, state: ExecutionState) -> Result<(), StoreError>;

    async fn update(&self, id: &TaskId, state: ExecutionState) -> Result<(), StoreError>;

    async fn upload(&self, id: &TaskId, file: LogArtifact) -> Result<(), StoreError>;

    async fn done(&self, id: &TaskId, state: ExecutionState) -> Result<(), StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<TaskStatus>, StoreError>;
}
