//! Frames exchanged between the server and a device over one connection

use crate::{DeviceErrorKind, RpcId, RpcRequest};
use serde::{Deserialize, Serialize};

/// A single message on the device link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame a device sends after connecting
    Hello { device_id: String },
    /// Periodic liveness signal from the device
    Heartbeat { uptime_ms: u64, pending: u32 },
    /// Command from the server
    Request {
        id: RpcId,
        method: String,
        params: String,
        one_way: bool,
        expiration_time: u64,
    },
    /// Device received a request
    Ack { id: RpcId },
    /// Device finished a two-way request
    Response {
        id: RpcId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<DeviceErrorKind>,
    },
}

impl Frame {
    /// Build the request frame a device receives for `request`
    pub fn request(request: &RpcRequest) -> Self {
        Frame::Request {
            id: request.id,
            method: request.method.clone(),
            params: request.params.clone(),
            one_way: request.one_way,
            expiration_time: request.expiration_time,
        }
    }

    /// Build a successful reply
    pub fn reply(id: RpcId, response: Option<String>) -> Self {
        Frame::Response {
            id,
            response,
            error: None,
        }
    }

    /// Build a failed reply
    pub fn error(id: RpcId, kind: DeviceErrorKind) -> Self {
        Frame::Response {
            id,
            response: None,
            error: Some(kind),
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "HELLO",
            Frame::Heartbeat { .. } => "HEARTBEAT",
            Frame::Request { .. } => "REQUEST",
            Frame::Ack { .. } => "ACK",
            Frame::Response { .. } => "RESPONSE",
        }
    }
}
