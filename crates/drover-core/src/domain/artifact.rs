//! Uploaded log artifacts.

use serde::{Deserialize, Serialize};

use super::state::now_unix;

/// MIME type of a step's captured log lines.
pub const MIME_JSON_LOGS: &str = "application/json+logs";

/// File name given to a step's log artifact.
pub const LOGS_FILE_NAME: &str = "logs.json";

/// A file uploaded by an agent for a task, usually one step's logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogArtifact {
    pub mime: String,
    pub proc: String,
    pub name: String,
    /// The file contents; log artifacts carry a JSON array of [`LogLine`]s.
    pub data: String,
    pub size: usize,
    pub time: i64,
}

impl LogArtifact {
    /// Package serialized log lines for `proc`.
    pub fn logs(proc: impl Into<String>, data: String) -> Self {
        Self {
            mime: MIME_JSON_LOGS.to_string(),
            proc: proc.into(),
            name: LOGS_FILE_NAME.to_string(),
            size: data.len(),
            data,
            time: now_unix(),
        }
    }
}

/// One captured output line of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub proc: String,
    /// Zero-based line number within the step.
    pub pos: usize,
    /// Seconds since the step's log stream opened.
    pub time: i64,
    pub out: String,
}
