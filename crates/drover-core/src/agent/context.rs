//! Per-task run context: one cancellation token plus the reason it fired.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const LIVE: u8 = 0;
const CANCELLED: u8 = 1;
const DEADLINE: u8 = 2;
const SETTLED: u8 = 3;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Why a run was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An operator cancelled the task.
    Cancelled,
    /// The task ran past its deadline.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Shared by the watcher, the heartbeat, the deadline timer and the execution.
///
/// The first of `cancel` and `settle` to run decides the outcome; whatever
/// comes after it does not change the recorded reason.
#[derive(Debug)]
pub struct RunContext {
    token: CancellationToken,
    reason: AtomicU8,
    deadline: Instant,
}

impl RunContext {
    pub fn new(timeout: Duration) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            token: CancellationToken::new(),
            reason: AtomicU8::new(LIVE),
            deadline: now.checked_add(timeout).unwrap_or(now + FAR_FUTURE),
        })
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Record `reason` (if the run is still live) and cancel the token.
    pub fn cancel(&self, reason: CancelReason) {
        let code = match reason {
            CancelReason::Cancelled => CANCELLED,
            CancelReason::DeadlineExceeded => DEADLINE,
        };
        let _ = self
            .reason
            .compare_exchange(LIVE, code, Ordering::AcqRel, Ordering::Acquire);
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<CancelReason> {
        decode(self.reason.load(Ordering::Acquire))
    }

    /// Close the run: later cancellations no longer count. Returns the reason
    /// recorded so far and releases everything waiting on the token.
    pub fn settle(&self) -> Option<CancelReason> {
        let reason = match self
            .reason
            .compare_exchange(LIVE, SETTLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => None,
            Err(prev) => decode(prev),
        };
        self.token.cancel();
        reason
    }

    /// Cancel with `DeadlineExceeded` once the deadline passes.
    pub async fn enforce_deadline(self: Arc<Self>) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {
                self.cancel(CancelReason::DeadlineExceeded);
            }
        }
    }
}

fn decode(code: u8) -> Option<CancelReason> {
    match code {
        CANCELLED => Some(CancelReason::Cancelled),
        DEADLINE => Some(CancelReason::DeadlineExceeded),
        _ => None,
    }
}
