//! Pipeline Executor port and the callbacks it drives.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use super::ExecutionEngine;
use crate::domain::Step;
use crate::error::ExecError;

/// A step's output, read until EOF by the logger.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Pipeline-wide state passed with every trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    /// Epoch seconds the pipeline started.
    pub started: i64,
    /// Set once any step has failed.
    pub error: Option<String>,
}

/// State of the step being traced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessState {
    /// Epoch seconds the step started; 0 when the executor does not know.
    pub started: i64,
    pub exited: bool,
    pub exit_code: i32,
}

/// What a `Tracer` sees, and may modify, for one step transition.
#[derive(Debug, Clone)]
pub struct TraceState {
    pub pipeline: PipelineState,
    pub process: ProcessState,
    /// The step itself. Environment edits made before it exits take effect.
    pub step: Step,
}

#[async_trait]
pub trait StepLogger: Send + Sync {
    /// Consume `output` until it ends.
    async fn log(&self, step: &Step, output: LogStream) -> std::io::Result<()>;
}

#[async_trait]
pub trait Tracer: Send + Sync {
    /// Called before a step starts and after it exits.
    async fn trace(&self, state: &mut TraceState);
}

/// Callbacks handed to the executor for one run.
#[derive(Clone)]
pub struct Hooks {
    pub logger: Arc<dyn StepLogger>,
    pub tracer: Arc<dyn Tracer>,
}

/// Interprets a task payload as a pipeline and runs its steps on `engine`.
///
/// The run must stop promptly once `cancel` fires. A structured failure is
/// reported as `ExecError::Exit(code)`.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    async fn execute(
        &self,
        pipeline: &serde_json::Value,
        engine: Arc<dyn ExecutionEngine>,
        hooks: Hooks,
        cancel: CancellationToken,
    ) -> Result<(), ExecError>;
}
