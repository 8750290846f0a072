//! devrpc Shared Protocol Types
//!
//! This crate provides the RPC value types, the persisted-call lifecycle and the
//! frame codec shared by the correlation server and remote devices.

pub mod codec;
pub mod frame;
pub mod lifecycle;
pub mod rpc;

use std::time::{SystemTime, UNIX_EPOCH};

pub use frame::Frame;
pub use lifecycle::{RpcStatus, TransitionResult};
pub use rpc::{DeviceErrorKind, RpcId, RpcOutcome, RpcRequest};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters shared by servers and devices
pub mod timing {
    /// Floor applied to a caller-requested RPC timeout
    pub const MIN_TIMEOUT_MS: u64 = 5_000;

    /// Timeout used when the caller does not request one
    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

    /// How long a resolved call stays in the registry to absorb late replies
    pub const RESOLVED_GRACE_MS: u64 = 30_000;

    /// Delay between two dispatch attempts of the same call
    pub const DISPATCH_RETRY_DELAY_MS: u64 = 100;

    /// Device heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;

    /// Device session is dropped if no heartbeat arrives within this window
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 15_000;

    /// A freshly connected device must identify itself within this window
    pub const HELLO_TIMEOUT_MS: u64 = 5_000;
}
