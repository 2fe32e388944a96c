//! Ports: the capabilities the runtime consumes but does not own.
//!
//! - `StatusStore`: where the server records what agents report.
//! - `ExecutionEngine` / `EngineProvider`: the backend that runs one step.
//! - `PipelineExecutor`: the interpreter that sequences a task's steps and
//!   calls back into the agent through `StepLogger` and `Tracer`.

pub mod engine;
pub mod executor;
pub mod status_store;

pub use self::engine::{EngineProvider, ExecutionEngine, RunningStep};
pub use self::executor::{
    Hooks, LogStream, PipelineExecutor, PipelineState, ProcessState, StepLogger, TraceState,
    Tracer,
};
pub use self::status_store::{StatusStore, TaskStatus};
