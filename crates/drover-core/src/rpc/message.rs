//! Wire messages: request/response envelopes and the closed method set.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{ExecutionState, Filter, LogArtifact, TaskId};
use crate::error::{PeerError, QueueError};

/// Largest WebSocket message or frame either side accepts. Leaves room for
/// a log upload at the default cap even when every byte needs escaping.
pub const MAX_MESSAGE_BYTES: usize = 64 << 20;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;
pub const TASK_NOT_FOUND: i64 = -32001;
pub const TASK_NOT_LEASED: i64 = -32002;

/// `{id, method, params}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// `{id, result | error}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the call outcome. A `null` result reads as `Value::Null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Protocol-level error carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("no such method: {method}"))
    }

    pub fn invalid_params(method: Method, e: serde_json::Error) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params for {method}: {e}"))
    }

    pub fn parse(e: serde_json::Error) -> Self {
        Self::new(PARSE_ERROR, format!("parse error: {e}"))
    }
}

impl From<PeerError> for RpcError {
    fn from(err: PeerError) -> Self {
        let code = match &err {
            PeerError::Queue(QueueError::NotFound(_)) => TASK_NOT_FOUND,
            PeerError::Queue(QueueError::NotLeased(_)) => TASK_NOT_LEASED,
            PeerError::Remote { code, .. } => *code,
            PeerError::Codec(_) => INTERNAL_ERROR,
            _ => SERVER_ERROR,
        };
        RpcError::new(code, err.to_string())
    }
}

/// The capability set exposed to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Next,
    Wait,
    Extend,
    Init,
    Update,
    Upload,
    Done,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::Next,
        Method::Wait,
        Method::Extend,
        Method::Init,
        Method::Update,
        Method::Upload,
        Method::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Next => "next",
            Method::Wait => "wait",
            Method::Extend => "extend",
            Method::Init => "init",
            Method::Update => "update",
            Method::Upload => "upload",
            Method::Done => "done",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RpcError::method_not_found(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    pub id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateParams {
    pub id: TaskId,
    pub state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadParams {
    pub id: TaskId,
    pub file: LogArtifact,
}

/// A decoded call: the method together with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Next(Filter),
    Wait(TaskId),
    Extend(TaskId),
    Init(TaskId, ExecutionState),
    Update(TaskId, ExecutionState),
    Upload(TaskId, LogArtifact),
    Done(TaskId, ExecutionState),
}

impl Call {
    /// Decode `params` according to `method`.
    pub fn decode(method: &str, params: Value) -> Result<Call, RpcError> {
        let method: Method = method.parse()?;
        let call = match method {
            Method::Next => Call::Next(decode_params(method, params)?),
            Method::Wait => Call::Wait(decode_params::<TaskParams>(method, params)?.id),
            Method::Extend => Call::Extend(decode_params::<TaskParams>(method, params)?.id),
            Method::Init => {
                let p: StateParams = decode_params(method, params)?;
                Call::Init(p.id, p.state)
            }
            Method::Update => {
                let p: StateParams = decode_params(method, params)?;
                Call::Update(p.id, p.state)
            }
            Method::Upload => {
                let p: UploadParams = decode_params(method, params)?;
                Call::Upload(p.id, p.file)
            }
            Method::Done => {
                let p: StateParams = decode_params(method, params)?;
                Call::Done(p.id, p.state)
            }
        };
        Ok(call)
    }

    pub fn method(&self) -> Method {
        match self {
            Call::Next(_) => Method::Next,
            Call::Wait(_) => Method::Wait,
            Call::Extend(_) => Method::Extend,
            Call::Init(..) => Method::Init,
            Call::Update(..) => Method::Update,
            Call::Upload(..) => Method::Upload,
            Call::Done(..) => Method::Done,
        }
    }

    /// Encode as a request with the given correlation id.
    pub fn into_request(self, id: u64) -> Result<Request, serde_json::Error> {
        let method = self.method().as_str().to_string();
        let params = match self {
            Call::Next(filter) => serde_json::to_value(filter)?,
            Call::Wait(id) | Call::Extend(id) => serde_json::to_value(TaskParams { id })?,
            Call::Init(id, state) | Call::Update(id, state) | Call::Done(id, state) => {
                serde_json::to_value(StateParams { id, state })?
            }
            Call::Upload(id, file) => serde_json::to_value(UploadParams { id, file })?,
        };
        Ok(Request { id, method, params })
    }
}

fn decode_params<T: DeserializeOwned>(method: Method, params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(method, e))
}
