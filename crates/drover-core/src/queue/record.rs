//! Task record: the queued task plus its lease bookkeeping.

use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use super::TaskState;
use crate::domain::{Task, WaitOutcome};

/// Metadata + task for an entry in the queue.
///
/// Design:
/// - This is the single source of truth for a task's state.
/// - The pending order holds TaskIds only.
/// - All state transitions happen here.
#[derive(Debug)]
pub struct TaskRecord {
    pub task: Task,
    pub state: TaskState,

    /// When the current lease lapses (only while Leased).
    pub lease_expires_at: Option<Instant>,

    /// Number of times this task has been leased (including the current one).
    pub leases: u32,

    /// Set once by an operator cancellation; never cleared.
    pub cancelled: bool,

    /// Fate broadcast to `wait` callers. `None` while the task is live.
    fate: watch::Sender<Option<WaitOutcome>>,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        let now = Instant::now();
        let (fate, _) = watch::channel(None);
        Self {
            task,
            state: TaskState::Pending,
            lease_expires_at: None,
            leases: 0,
            cancelled: false,
            fate,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hand the task to a poller for `ttl`.
    pub fn lease(&mut self, ttl: Duration) {
        let now = Instant::now();
        self.state = TaskState::Leased;
        self.lease_expires_at = Some(now + ttl);
        self.leases += 1;
        self.updated_at = now;
    }

    /// Push the lease deadline out by `ttl` from now.
    pub fn extend(&mut self, ttl: Duration) {
        let now = Instant::now();
        self.lease_expires_at = Some(now + ttl);
        self.updated_at = now;
    }

    /// Lease lapsed: back to Pending.
    pub fn requeue(&mut self) {
        self.state = TaskState::Pending;
        self.lease_expires_at = None;
        self.updated_at = Instant::now();
    }

    pub fn is_lease_expired(&self, now: Instant) -> bool {
        self.state == TaskState::Leased && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Record the operator cancellation and wake waiters.
    ///
    /// Returns false when the task was already cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        self.updated_at = Instant::now();
        self.fate.send_replace(Some(WaitOutcome::Cancelled));
        true
    }

    /// Wake waiters with a normal completion, unless a cancellation already went out.
    pub fn complete(&self) {
        if self.fate.borrow().is_none() {
            self.fate.send_replace(Some(WaitOutcome::Completed));
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<WaitOutcome>> {
        self.fate.subscribe()
    }
}
