use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::TaskId;

/// Label set used for matching tasks to agents (`platform=linux/amd64`, ...).
pub type Labels = BTreeMap<String, String>;

/// A unit of pipeline work as handed to an agent.
///
/// `data` is the serialized pipeline definition. The queue and transport never
/// look inside it; only the Pipeline Executor on the agent does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default)]
    pub labels: Labels,

    /// Execution timeout in minutes. 0 means "use the agent default".
    #[serde(default, rename = "timeout")]
    pub timeout_minutes: u64,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            labels: Labels::new(),
            timeout_minutes: 0,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    /// Effective execution timeout: the task's own value, or `default` when unset.
    pub fn timeout(&self, default: Duration) -> Duration {
        match self.timeout_minutes {
            0 => default,
            minutes => Duration::from_secs(minutes.saturating_mul(60)),
        }
    }
}

/// Label predicate supplied by a poller.
///
/// A task matches when every filter key is present in the task's labels with an
/// equal value. Extra task labels never exclude a match; an empty filter
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub labels: Labels,
}

impl Filter {
    pub fn new(labels: Labels) -> Self {
        Self { labels }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}
