//! Domain model (ids, tasks, filters, execution state, steps, artifacts).

pub mod artifact;
pub mod ids;
pub mod state;
pub mod step;
pub mod task;

pub use artifact::{LogArtifact, LogLine, LOGS_FILE_NAME, MIME_JSON_LOGS};
pub use ids::TaskId;
pub use state::{now_unix, ExecutionState, WaitOutcome, EXIT_CODE_KILLED};
pub use step::Step;
pub use task::{Filter, Labels, Task};
