use thiserror::Error;

use crate::domain::TaskId;

/// Errors raised by a [`TaskQueue`](crate::queue::TaskQueue).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task is not leased: {0}")]
    NotLeased(TaskId),

    #[error("task already queued: {0}")]
    Duplicate(TaskId),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a [`StatusStore`](crate::ports::StatusStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("status store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by a [`Peer`](crate::rpc::Peer) call, local or remote.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The server answered the call with an error.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// A single connection-level failure (dial, send, or dropped connection).
    #[error("transport: {0}")]
    Transport(String),

    #[error("transport gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl PeerError {
    /// Whether the failure happened below the protocol (and may be retried).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PeerError::Transport(_) | PeerError::RetriesExhausted { .. }
        )
    }
}

/// Errors raised while provisioning or driving an Execution Engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("cannot start step {step}: {reason}")]
    Start { step: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a Pipeline Executor run failed.
///
/// `Exit` carries a structured exit code and is reported verbatim; every other
/// variant is reported as exit code 1 with the error text.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("exit code {0}")]
    Exit(i32),

    #[error("execution cancelled")]
    Cancelled,

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while installing the log subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log format: {0}")]
    InvalidFormat(String),

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("logger initialization failed: {0}")]
    Init(String),
}

/// Errors that stop an agent worker loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("fetching next task: {0}")]
    Fetch(#[source] PeerError),

    #[error("acquiring execution engine: {0}")]
    Engine(#[from] EngineError),
}
