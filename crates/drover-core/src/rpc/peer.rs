//! The agent-facing capability set and its queue-backed implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::message::Call;
use crate::domain::{ExecutionState, Filter, LogArtifact, Task, TaskId, WaitOutcome};
use crate::error::PeerError;
use crate::ports::StatusStore;
use crate::queue::TaskQueue;

/// What an agent may ask of the server.
///
/// The server binds one implementation per connection; the agent holds a
/// client implementation that forwards each call over the wire.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Lease the next task matching `filter`. `None` when nothing matched in time.
    async fn next(&self, filter: &Filter) -> Result<Option<Task>, PeerError>;

    /// Block until the task is cancelled or leaves the queue.
    async fn wait(&self, id: &TaskId) -> Result<WaitOutcome, PeerError>;

    async fn extend(&self, id: &TaskId) -> Result<(), PeerError>;

    async fn init(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError>;

    async fn update(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError>;

    async fn upload(&self, id: &TaskId, file: LogArtifact) -> Result<(), PeerError>;

    /// Record the final state and acknowledge the task.
    async fn done(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError>;
}

/// Server-side peer backed by a task queue and a status store.
#[derive(Clone)]
pub struct QueuePeer {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn StatusStore>,
}

impl QueuePeer {
    pub fn new(queue: Arc<dyn TaskQueue>, store: Arc<dyn StatusStore>) -> Self {
        Self { queue, store }
    }
}

#[async_trait]
impl Peer for QueuePeer {
    async fn next(&self, filter: &Filter) -> Result<Option<Task>, PeerError> {
        let task = self.queue.poll(filter).await?;
        if let Some(task) = &task {
            info!(task_id = %task.id, "task leased");
        }
        Ok(task)
    }

    async fn wait(&self, id: &TaskId) -> Result<WaitOutcome, PeerError> {
        Ok(self.queue.wait(id).await?)
    }

    async fn extend(&self, id: &TaskId) -> Result<(), PeerError> {
        debug!(task_id = %id, "lease extended");
        Ok(self.queue.extend(id).await?)
    }

    async fn init(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
        Ok(self.store.init(id, state).await?)
    }

    async fn update(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
        Ok(self.store.update(id, state).await?)
    }

    async fn upload(&self, id: &TaskId, file: LogArtifact) -> Result<(), PeerError> {
        Ok(self.store.upload(id, file).await?)
    }

    async fn done(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
        let exit_code = state.exit_code;
        self.store.done(id, state).await?;
        self.queue.done(id).await?;
        info!(task_id = %id, exit_code, "task done");
        Ok(())
    }
}

/// Route a decoded call to `peer` and encode its result.
pub async fn dispatch(peer: &dyn Peer, call: Call) -> Result<Value, PeerError> {
    let result = match call {
        Call::Next(filter) => serde_json::to_value(peer.next(&filter).await?)?,
        Call::Wait(id) => serde_json::to_value(peer.wait(&id).await?)?,
        Call::Extend(id) => {
            peer.extend(&id).await?;
            Value::Null
        }
        Call::Init(id, state) => {
            peer.init(&id, state).await?;
            Value::Null
        }
        Call::Update(id, state) => {
            peer.update(&id, state).await?;
            Value::Null
        }
        Call::Upload(id, file) => {
            peer.upload(&id, file).await?;
            Value::Null
        }
        Call::Done(id, state) => {
            peer.done(&id, state).await?;
            Value::Null
        }
    };
    Ok(result)
}
