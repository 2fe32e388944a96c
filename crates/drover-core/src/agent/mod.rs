//! Agent runtime: leases tasks, supervises their execution, reports back.

pub mod config;
pub mod context;
pub mod hooks;
pub mod pool;
pub mod runner;

pub use config::AgentConfig;
pub use context::{CancelReason, RunContext};
pub use hooks::{LineWriter, StatusTracer, UploadLogger};
pub use pool::{ShutdownHandle, WorkerGroup};
pub use runner::{Runner, resolve_exit};
