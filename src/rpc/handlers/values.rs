//! getValue / setValue handlers over the in-memory value map

use super::HandlerContext;
use crate::rpc::RpcResult;
use devrpc_shared::DeviceErrorKind;
use serde_json::{json, Value};
use tracing::debug;

fn rejected(message: impl Into<String>) -> RpcResult {
    RpcResult::Failed {
        kind: DeviceErrorKind::Rejected,
        message: message.into(),
    }
}

fn key_param(params: &Value) -> Option<&str> {
    params
        .get("key")
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
}

/// Handle `getValue`: `{"key": ...}`
pub async fn handle_get_value(ctx: &HandlerContext, params: &Value) -> RpcResult {
    let Some(key) = key_param(params) else {
        return rejected("Missing key parameter");
    };

    match ctx.values.read().await.get(key) {
        Some(value) => RpcResult::Completed {
            response: Some(json!({ "key": key, "value": value })),
        },
        None => rejected(format!("No value stored under {}", key)),
    }
}

/// Handle `setValue`: `{"key": ..., "value": ...}`
pub async fn handle_set_value(ctx: &HandlerContext, params: &Value) -> RpcResult {
    let Some(key) = key_param(params) else {
        return rejected("Missing key parameter");
    };
    let Some(value) = params.get("value") else {
        return rejected("Missing value parameter");
    };

    debug!("[setValue] {} = {}", key, value);
    let previous = ctx
        .values
        .write()
        .await
        .insert(key.to_string(), value.clone());

    RpcResult::Completed {
        response: Some(json!({
            "key": key,
            "value": value,
            "previous": previous,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    fn ctx() -> HandlerContext {
        HandlerContext {
            device_id: "edge-test".into(),
            uptime: Duration::from_secs(1),
            values: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let ctx = ctx();
        let set = handle_set_value(&ctx, &json!({"key": "speed", "value": 3})).await;
        assert_eq!(
            set,
            RpcResult::Completed {
                response: Some(json!({"key": "speed", "value": 3, "previous": null}))
            }
        );

        let get = handle_get_value(&ctx, &json!({"key": "speed"})).await;
        assert_eq!(
            get,
            RpcResult::Completed {
                response: Some(json!({"key": "speed", "value": 3}))
            }
        );
    }

    #[tokio::test]
    async fn test_overwrite_reports_previous() {
        let ctx = ctx();
        handle_set_value(&ctx, &json!({"key": "mode", "value": "idle"})).await;
        let result = handle_set_value(&ctx, &json!({"key": "mode", "value": "busy"})).await;
        match result {
            RpcResult::Completed { response: Some(body) } => {
                assert_eq!(body["previous"], "idle");
                assert_eq!(body["value"], "busy");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected() {
        let ctx = ctx();
        for result in [
            handle_get_value(&ctx, &json!({"key": "absent"})).await,
            handle_get_value(&ctx, &Value::Null).await,
            handle_set_value(&ctx, &json!({"value": 1})).await,
            handle_set_value(&ctx, &json!({"key": "k"})).await,
        ] {
            assert!(matches!(
                result,
                RpcResult::Failed {
                    kind: DeviceErrorKind::Rejected,
                    ..
                }
            ));
        }
    }
}
