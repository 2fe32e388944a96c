//! In-memory queue implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::{QueueConfig, TaskQueue, TaskRecord, TaskState};
use crate::domain::{Filter, Task, TaskId, WaitOutcome};
use crate::error::QueueError;
use crate::observability::QueueCounts;

/// In-memory queue state.
struct InMemoryQueueState {
    /// All task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Pending order (TaskIds only), oldest first.
    pending: VecDeque<TaskId>,
}

impl InMemoryQueueState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Lease the oldest pending task whose labels satisfy `filter`.
    fn lease_matching(&mut self, filter: &Filter, ttl: Duration) -> Option<Task> {
        let records = &self.records;
        let pos = self.pending.iter().position(|id| {
            records
                .get(id)
                .is_some_and(|r| r.state.is_runnable() && filter.matches(&r.task.labels))
        })?;
        let id = self.pending.remove(pos)?;
        let record = self.records.get_mut(&id)?;
        record.lease(ttl);
        Some(record.task.clone())
    }

    /// Requeue lapsed leases; drop lapsed tasks that were cancelled.
    fn reap_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<TaskId> = self
            .records
            .iter()
            .filter(|(_, r)| r.is_lease_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            let cancelled = self.records.get(id).is_some_and(|r| r.cancelled);
            if cancelled {
                self.records.remove(id);
                debug!(task_id = %id, "dropping cancelled task with lapsed lease");
                continue;
            }
            if let Some(record) = self.records.get_mut(id) {
                record.requeue();
                // It was polled before anything still pending behind it.
                self.pending.push_front(id.clone());
                debug!(task_id = %id, leases = record.leases, "lease expired, task requeued");
            }
        }
        expired.len()
    }

    fn next_lease_expiry(&self) -> Option<Instant> {
        self.records
            .values()
            .filter_map(|r| r.lease_expires_at)
            .min()
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Leased => counts.leased += 1,
            }
            if record.cancelled {
                counts.cancelled += 1;
            }
        }
        counts
    }
}

/// In-memory queue implementation.
pub struct InMemoryQueue {
    state: Arc<Mutex<InMemoryQueueState>>,
    notify: Arc<Notify>,
    config: QueueConfig,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryQueueState::new())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn push(&self, task: Task) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            if state.records.contains_key(&task.id) {
                return Err(QueueError::Duplicate(task.id));
            }
            let id = task.id.clone();
            state.records.insert(id.clone(), TaskRecord::new(task));
            state.pending.push_back(id);
        }

        // Pollers filter on labels, so wake all of them rather than one.
        self.notify.notify_waiters();
        Ok(())
    }

    async fn poll(&self, filter: &Filter) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            // Register before scanning so a push between scan and await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.state.lock().await;
                state.reap_expired(Instant::now());
                if let Some(task) = state.lease_matching(filter, self.config.lease_ttl) {
                    return Ok(Some(task));
                }
                state.next_lease_expiry()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Wake for a push, the next lapsing lease, or the poll deadline.
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn extend(&self, id: &TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if record.state != TaskState::Leased {
            return Err(QueueError::NotLeased(id.clone()));
        }
        record.extend(self.config.lease_ttl);
        Ok(())
    }

    async fn done(&self, id: &TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.remove(id) else {
            return Ok(());
        };
        record.complete();
        if record.state == TaskState::Pending {
            state.pending.retain(|p| p != id);
        }
        Ok(())
    }

    async fn wait(&self, id: &TaskId) -> Result<WaitOutcome, QueueError> {
        let mut rx = {
            let state = self.state.lock().await;
            match state.records.get(id) {
                Some(record) => record.subscribe(),
                None => return Ok(WaitOutcome::Completed),
            }
        };

        // A dropped sender means the record is gone without a cancellation.
        match rx.wait_for(|fate| fate.is_some()).await {
            Ok(fate) => Ok((*fate).unwrap_or(WaitOutcome::Completed)),
            Err(_) => Ok(WaitOutcome::Completed),
        }
    }

    async fn cancel(&self, id: &TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        if !record.cancel() {
            return Ok(());
        }
        if record.state == TaskState::Pending {
            state.records.remove(id);
            state.pending.retain(|p| p != id);
            debug!(task_id = %id, "pending task evicted by cancellation");
        } else {
            debug!(task_id = %id, "leased task signalled for cancellation");
        }
        Ok(())
    }

    async fn reap_expired(&self) -> Result<usize, QueueError> {
        let reaped = {
            let mut state = self.state.lock().await;
            state.reap_expired(Instant::now())
        };
        if reaped > 0 {
            self.notify.notify_waiters();
        }
        Ok(reaped)
    }

    async fn info(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }
}
