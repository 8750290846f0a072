//! Device channel abstraction: how commands reach devices and how replies come back

use async_trait::async_trait;
use devrpc_shared::{DeviceErrorKind, RpcId, RpcRequest};
use std::sync::Arc;
use thiserror::Error;

/// Immediate result of handing a command to the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAck {
    /// Written to a live device connection
    Sent,
    /// Device offline; the channel holds the command until it reconnects
    Queued,
}

/// Immediate dispatch failures, retried by the dispatcher while retries remain
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Progress reported by the channel after dispatch, on its own schedule
///
/// Events originating from a device carry the id of the device that sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A queued command was written to the device after it reconnected
    Sent { id: RpcId },
    /// Device acknowledged receipt
    Delivered { id: RpcId, device_id: String },
    /// Device replied
    Response {
        id: RpcId,
        device_id: String,
        response: Option<String>,
        error: Option<DeviceErrorKind>,
    },
    /// The channel gave up on a command it had accepted
    Unreachable { id: RpcId },
}

/// Transport that carries commands to devices
///
/// `dispatch` must not wait for the device to answer; replies and progress are
/// reported later as [`ChannelEvent`]s.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Hand `request` to its device
    async fn dispatch(&self, request: Arc<RpcRequest>) -> Result<DispatchAck, DispatchError>;

    /// Drop `request` if the channel still holds it undelivered
    ///
    /// Called once the call has resolved. Returns `true` if a held command was removed.
    async fn withdraw(&self, _request: &Arc<RpcRequest>) -> bool {
        false
    }

    /// Human-readable name for this channel
    fn name(&self) -> &'static str;
}
