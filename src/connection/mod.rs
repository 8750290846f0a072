//! Connection management for the link to the RPC server
//!
//! This module handles:
//! - Persistent TCP connection with automatic reconnection
//! - Hello handshake on every connect
//! - Bidirectional frame streaming
//! - Heartbeat management

mod manager;

pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager};
