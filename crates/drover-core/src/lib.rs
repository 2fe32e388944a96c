//! drover-core
//!
//! Core building blocks for distributing pipeline tasks to a fleet of agents.
//!
//! # Modules
//! - **domain**: tasks, filters, execution state, log artifacts
//! - **queue**: lease-based task queue with label-filtered polling
//! - **ports**: status store, execution engine and pipeline executor seams
//! - **impls**: in-process implementations of the ports
//! - **rpc**: the agent/server protocol over WebSocket (server, client, peer)
//! - **agent**: worker pool and the per-task supervision loop
//! - **observability**: queue counters and log setup

pub mod agent;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod rpc;
