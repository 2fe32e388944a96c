//! Agent configuration.

use std::time::Duration;

use crate::domain::{Filter, Labels, Task};

/// Per-agent settings, built once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Labels a task must carry to be leased by this agent.
    pub labels: Labels,

    /// Number of worker loops.
    pub workers: usize,

    /// Output captured per step before the rest is discarded.
    pub max_log_bytes: usize,

    /// Size cap of one uploaded log artifact.
    pub max_upload_bytes: usize,

    /// Deadline for tasks that do not carry their own timeout.
    pub default_timeout: Duration,

    /// How often a held lease is extended.
    pub heartbeat_interval: Duration,

    /// Copy step output to the agent's stderr.
    pub mirror_logs: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            labels: Labels::new(),
            workers: 1,
            max_log_bytes: 5_000_000,
            max_upload_bytes: 5_000_000,
            default_timeout: Duration::from_secs(60 * 60),
            heartbeat_interval: Duration::from_secs(60),
            mirror_logs: true,
        }
    }
}

impl AgentConfig {
    pub fn filter(&self) -> Filter {
        Filter::new(self.labels.clone())
    }

    /// How long `task` may run.
    pub fn deadline_for(&self, task: &Task) -> Duration {
        task.timeout(self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 60 * 60)]
    #[case(1, 60)]
    #[case(90, 90 * 60)]
    fn deadline_follows_task_timeout(#[case] minutes: u64, #[case] secs: u64) {
        let cfg = AgentConfig::default();
        let task = Task::new("t1", serde_json::Value::Null).with_timeout_minutes(minutes);
        assert_eq!(cfg.deadline_for(&task), Duration::from_secs(secs));
    }
}
