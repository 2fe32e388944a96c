//! Execution Engine port.

use std::sync::Arc;

use async_trait::async_trait;

use super::LogStream;
use crate::domain::Step;
use crate::error::EngineError;

/// Backend that runs a single step in isolation.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Start `command` for `step`, with the step's environment applied.
    async fn start(&self, step: &Step, command: &str) -> Result<Box<dyn RunningStep>, EngineError>;
}

/// Handle to a step the engine has started.
#[async_trait]
pub trait RunningStep: Send {
    /// Combined output stream. Yields `Some` once.
    fn take_output(&mut self) -> Option<LogStream>;

    /// Wait for the step to exit and return its exit code.
    async fn wait(&mut self) -> Result<i32, EngineError>;

    /// Stop the step. Killing an exited step is not an error.
    async fn kill(&mut self) -> Result<(), EngineError>;
}

/// Hands out an engine per task.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn ExecutionEngine>, EngineError>;
}
