//! Execution status as reported by agents.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Exit code reported for a task that was cancelled or ran past its deadline.
pub const EXIT_CODE_KILLED: i32 = 137;

/// Per-task (or per-step) execution record.
///
/// `proc` is empty for the task-level record and holds the step alias for
/// per-step records. Timestamps are epoch seconds; 0 means "not yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proc: String,

    #[serde(default)]
    pub started: i64,

    #[serde(default)]
    pub finished: i64,

    #[serde(default)]
    pub exited: bool,

    #[serde(default)]
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Per-task update sequence number. 0 means unsequenced.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl ExecutionState {
    /// Task-level state stamped with the current time as its start.
    pub fn started_now() -> Self {
        Self {
            started: now_unix(),
            ..Self::default()
        }
    }

    /// Mark the record as exited at the current time.
    pub fn finish(&mut self) {
        self.finished = now_unix();
        self.exited = true;
    }

    pub fn is_success(&self) -> bool {
        self.exited && self.exit_code == 0
    }
}

/// How a `wait` call ended.
///
/// `Completed` means the task left the queue normally (done, or it never
/// existed); `Cancelled` means an operator cancelled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitOutcome {
    Completed,
    Cancelled,
}

/// Current time in epoch seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_sets_exited_and_finished() {
        let mut state = ExecutionState::started_now();
        assert!(!state.exited);
        assert_eq!(state.finished, 0);

        state.finish();

        assert!(state.exited);
        assert!(state.finished >= state.started);
        assert!(state.is_success());
    }

    #[test]
    fn wire_shape_omits_empty_fields() {
        let state = ExecutionState {
            started: 10,
            finished: 20,
            exited: true,
            exit_code: 137,
            ..ExecutionState::default()
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["exit_code"], 137);
        assert!(v.get("proc").is_none());
        assert!(v.get("error").is_none());
        assert!(v.get("seq").is_none());
    }

    #[test]
    fn wait_outcome_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&WaitOutcome::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
