//! echo handler

use super::HandlerContext;
use crate::rpc::RpcResult;
use serde_json::Value;

/// Handle `echo`: reply with the parameters unchanged
pub async fn handle_echo(_ctx: &HandlerContext, params: &Value) -> RpcResult {
    RpcResult::Completed {
        response: (!params.is_null()).then(|| params.clone()),
    }
}
