//! InMemoryStatusStore: keeps reported status in a map, for single-process servers and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{ExecutionState, LogArtifact, TaskId};
use crate::error::StoreError;
use crate::ports::{StatusStore, TaskStatus};

#[derive(Default)]
pub struct InMemoryStatusStore {
    tasks: RwLock<HashMap<TaskId, TaskStatus>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn init(&self, id: &TaskId, state: ExecutionState) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        tasks.entry(id.clone()).or_default().state = state;
        Ok(())
    }

    async fn update(&self, id: &TaskId, state: ExecutionState) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let status = tasks.entry(id.clone()).or_default();

        let slot = if state.proc.is_empty() {
            &mut status.state
        } else {
            status.steps.entry(state.proc.clone()).or_default()
        };

        // Sequenced updates may arrive out of order; keep the newest.
        if state.seq != 0 && slot.seq >= state.seq {
            debug!(task_id = %id, proc = %state.proc, seq = state.seq, "dropping stale update");
            return Ok(());
        }
        *slot = state;
        Ok(())
    }

    async fn upload(&self, id: &TaskId, file: LogArtifact) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        tasks.entry(id.clone()).or_default().artifacts.push(file);
        Ok(())
    }

    async fn done(&self, id: &TaskId, state: ExecutionState) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        tasks.entry(id.clone()).or_default().state = state;
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskStatus>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(id).cloned())
    }
}
