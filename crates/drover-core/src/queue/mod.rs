//! Queue module: lease-based task queue with label-filtered polling.

mod memory;
mod record;
mod state;

pub use memory::InMemoryQueue;
pub use record::TaskRecord;
pub use state::TaskState;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Filter, Task, TaskId, WaitOutcome};
use crate::error::QueueError;
use crate::observability::QueueCounts;

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a lease lives without an `extend`.
    pub lease_ttl: Duration,

    /// How long `poll` waits for a matching task before returning `None`.
    pub poll_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5 * 60),
            poll_timeout: Duration::from_secs(30),
        }
    }
}

/// Queue port (interface).
///
/// Design intent:
/// - The queue owns leases: at most one active lease per task.
/// - `wait` is a notification channel, not a result query.
/// - Implementations must make `poll` atomic across concurrent pollers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a new task.
    async fn push(&self, task: Task) -> Result<(), QueueError>;

    /// Lease one pending task matching `filter`, or `None` if nothing matched in time.
    async fn poll(&self, filter: &Filter) -> Result<Option<Task>, QueueError>;

    /// Renew the lease on a task.
    async fn extend(&self, id: &TaskId) -> Result<(), QueueError>;

    /// Acknowledge and remove a task. Acknowledging an unknown task is a no-op.
    async fn done(&self, id: &TaskId) -> Result<(), QueueError>;

    /// Block until the task is cancelled or removed.
    async fn wait(&self, id: &TaskId) -> Result<WaitOutcome, QueueError>;

    /// Operator cancellation: evicts a pending task, signals the holder of a leased one.
    async fn cancel(&self, id: &TaskId) -> Result<(), QueueError>;

    /// Requeue every task whose lease lapsed. Returns how many were touched.
    async fn reap_expired(&self) -> Result<usize, QueueError>;

    /// Observability hook.
    async fn info(&self) -> Result<QueueCounts, QueueError>;
}
