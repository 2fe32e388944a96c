//! RPC module: the agent/server protocol over a persistent WebSocket.

pub mod backoff;
pub mod client;
pub mod message;
pub mod peer;
pub mod server;

pub use backoff::Backoff;
pub use client::{ClientConfig, RpcClient};
pub use message::{Call, Method, Request, Response, RpcError};
pub use peer::{Peer, QueuePeer, dispatch};
pub use server::{ApiError, BROKER_PATH, ServerConfig, ServerState, router, serve, serve_connection};
