//! Domain identifiers.
//!
//! Task ids cross the wire as plain strings: producers may bring their own
//! (`"t1"`, a build number, ...) or let the queue mint one. Minted ids are
//! ULIDs, so they sort by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Prefix for ids minted by [`TaskId::generate`].
const GENERATED_PREFIX: &str = "task-";

/// Identifier of a queued task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(format!("{GENERATED_PREFIX}{}", Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
