//! RPC execution for the device simulator
//!
//! This module handles:
//! - Dropping requests that expired in transit
//! - Acknowledging receipt to the server
//! - Dispatching to method handlers
//! - Replying to two-way requests

mod executor;
pub mod handlers;

pub use executor::{IncomingRpc, RpcExecutor, RpcResult};
