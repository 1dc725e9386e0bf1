//! Remote shell execution service.
//!
//! Clients register a session, then run shell commands on the host through
//! either gRPC or HTTP. Every command passes an ordered policy gate (token,
//! ban list, whitelist, rate limit, chaining) before it reaches the process
//! executor.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod executor;
pub mod grpc_server;
pub mod http_server;
pub mod policy;
pub mod service;
pub mod state;
