//! Impls: in-process implementations of the ports.
//!
//! - **InMemoryStatusStore**: server-side status store for a single process.
//! - **ProcessEngine**: runs each step as a local shell process.
//! - **SequentialExecutor**: runs a JSON list of steps one after another.

pub mod inmem_status;
pub mod process_engine;
pub mod sequential;

pub use self::inmem_status::InMemoryStatusStore;
pub use self::process_engine::{ProcessEngine, ProcessEngineConfig, ProcessEngineProvider};
pub use self::sequential::{PipelineSpec, SequentialExecutor, StepSpec};
