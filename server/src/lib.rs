//! Device RPC server
//!
//! Correlates commands sent to remote devices with their eventual replies and
//! exposes the result over HTTP.

pub mod config;
pub mod http;
pub mod rpc;
pub mod session;
