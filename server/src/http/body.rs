//! JSON body accepted by the RPC endpoints

use crate::rpc::SubmitRequest;
use devrpc_shared::RpcId;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BodyError {
    #[error("invalid request body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("request body has no method")]
    MissingMethod,
}

/// Body of `POST /api/rpc/.../{deviceId}`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequestBody {
    pub method: Option<String>,
    /// Passed to the device as JSON text
    pub params: Option<serde_json::Value>,
    /// Milliseconds
    pub timeout: Option<u64>,
    /// Epoch milliseconds, overrides `timeout`
    pub expiration_time: Option<u64>,
    #[serde(rename = "requestUUID")]
    pub request_uuid: Option<RpcId>,
    pub persistent: Option<bool>,
    pub retries: Option<u32>,
    pub additional_info: Option<serde_json::Value>,
}

impl RpcRequestBody {
    pub fn parse(raw: &str) -> Result<Self, BodyError> {
        let body: Self = serde_json::from_str(raw)?;
        match body.method.as_deref() {
            Some(method) if !method.trim().is_empty() => Ok(body),
            _ => Err(BodyError::MissingMethod),
        }
    }

    pub fn into_submit(self, tenant_id: String, device_id: String, one_way: bool) -> SubmitRequest {
        SubmitRequest {
            id: self.request_uuid,
            tenant_id,
            device_id,
            one_way,
            method: self.method,
            params: self.params.map(|params| params.to_string()),
            timeout_ms: self.timeout,
            expiration_time: self.expiration_time,
            persisted: self.persistent.unwrap_or(false),
            retries: self.retries,
            additional_info: self.additional_info,
        }
    }
}
