use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One unit of execution within a task's pipeline.
///
/// `environment` stays `None` until someone needs to write to it; the tracer
/// initializes it before stamping build status variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub alias: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

impl Step {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            environment: None,
        }
    }

    /// Environment map, created on first use.
    pub fn environment_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.environment.get_or_insert_with(BTreeMap::new)
    }
}
