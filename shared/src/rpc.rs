//! RPC value types: request descriptor, correlation id and terminal outcome

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Correlation id linking an outbound command to its eventual reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcId(Uuid);

impl RpcId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RpcId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RpcId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for RpcId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// One RPC call, immutable once the dispatcher has built it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub id: RpcId,
    pub tenant_id: String,
    pub device_id: String,
    pub one_way: bool,
    pub method: String,
    /// Opaque payload, passed to the device untouched
    pub params: String,
    /// Absolute deadline, milliseconds since Unix epoch
    pub expiration_time: u64,
    pub persisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Value>,
}

impl RpcRequest {
    /// Check if the deadline has passed at `now_ms`
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expiration_time
    }

    /// Check if the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(crate::now_ms())
    }

    /// Time left until the deadline, zero once expired
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expiration_time.saturating_sub(now_ms))
    }
}

/// Structured failure reported by a device or its transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceErrorKind {
    /// Device does not know the method
    NotFound,
    /// Device refused to run the method for this caller
    Forbidden,
    /// Device understood the method but refused the parameters or its current state
    Rejected,
    /// Device failed while executing
    Internal,
    /// Anything the device reported that has no dedicated kind
    Other(String),
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorKind::NotFound => write!(f, "not found"),
            DeviceErrorKind::Forbidden => write!(f, "forbidden"),
            DeviceErrorKind::Rejected => write!(f, "rejected"),
            DeviceErrorKind::Internal => write!(f, "internal"),
            DeviceErrorKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// Terminal result of an RPC call, assigned exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcOutcome {
    /// Device replied; `None` for one-way calls and empty replies
    Success { response: Option<String> },
    /// Device or transport reported a structured failure
    DeviceError { kind: DeviceErrorKind },
    /// Nothing arrived before the expiration time
    Timeout,
    /// The device could not be reached
    NoActiveConnection,
    /// The call was abandoned by its caller or by shutdown
    Cancelled,
}

impl RpcOutcome {
    /// Build the outcome carried by a device reply; a reported error wins over a payload
    pub fn from_reply(response: Option<String>, error: Option<DeviceErrorKind>) -> Self {
        match error {
            Some(kind) => RpcOutcome::DeviceError { kind },
            None => RpcOutcome::Success { response },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RpcOutcome::Success { .. })
    }
}

impl fmt::Display for RpcOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcOutcome::Success { response: Some(_) } => write!(f, "SUCCESS"),
            RpcOutcome::Success { response: None } => write!(f, "SUCCESS (empty)"),
            RpcOutcome::DeviceError { kind } => write!(f, "DEVICE_ERROR ({})", kind),
            RpcOutcome::Timeout => write!(f, "TIMEOUT"),
            RpcOutcome::NoActiveConnection => write!(f, "NO_ACTIVE_CONNECTION"),
            RpcOutcome::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(expiration_time: u64) -> RpcRequest {
        RpcRequest {
            id: RpcId::new(),
            tenant_id: "tenant-a".into(),
            device_id: "edge-001".into(),
            one_way: false,
            method: "getValue".into(),
            params: "{}".into(),
            expiration_time,
            persisted: false,
            retries: None,
            additional_info: None,
        }
    }

    #[test]
    fn test_rpc_id_parse_and_display() {
        let id = RpcId::new();
        let parsed: RpcId = id.to_string().parse().expect("parse id");
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RpcId>().is_err());
    }

    #[test]
    fn test_request_expiry() {
        let req = request(10_000);
        assert!(!req.is_expired_at(9_999));
        assert!(req.is_expired_at(10_000));
        assert_eq!(req.remaining(4_000), Duration::from_millis(6_000));
        assert_eq!(req.remaining(20_000), Duration::ZERO);
    }

    #[test]
    fn test_request_json_uses_camel_case() {
        let req = request(42);
        let json = serde_json::to_value(&req).expect("serialize");
        assert_eq!(json["deviceId"], "edge-001");
        assert_eq!(json["oneWay"], false);
        assert_eq!(json["expirationTime"], 42);
        assert!(json.get("retries").is_none());
    }

    #[test]
    fn test_outcome_from_reply() {
        assert_eq!(
            RpcOutcome::from_reply(Some("{}".into()), None),
            RpcOutcome::Success {
                response: Some("{}".into())
            }
        );
        assert_eq!(
            RpcOutcome::from_reply(Some("{}".into()), Some(DeviceErrorKind::Rejected)),
            RpcOutcome::DeviceError {
                kind: DeviceErrorKind::Rejected
            }
        );
    }

    #[test]
    fn test_device_error_kind_wire_names() {
        let json = serde_json::to_string(&DeviceErrorKind::NotFound).expect("serialize");
        assert_eq!(json, "\"NOT_FOUND\"");
        let other: DeviceErrorKind =
            serde_json::from_str(r#"{"OTHER":"busy"}"#).expect("deserialize");
        assert_eq!(other, DeviceErrorKind::Other("busy".into()));
    }
}
