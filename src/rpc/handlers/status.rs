//! getStatus handler

use super::HandlerContext;
use crate::rpc::RpcResult;
use serde_json::{json, Value};
use tracing::debug;

/// Handle `getStatus`; parameters are ignored
pub async fn handle_get_status(ctx: &HandlerContext, _params: &Value) -> RpcResult {
    let stored = ctx.values.read().await.len();
    debug!("[getStatus] {} holds {} values", ctx.device_id, stored);

    RpcResult::Completed {
        response: Some(json!({
            "deviceId": ctx.device_id,
            "uptimeMs": ctx.uptime.as_millis() as u64,
            "values": stored,
        })),
    }
}
