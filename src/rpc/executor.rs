//! RPC executor - acknowledges, runs and answers incoming requests

use super::handlers::{self, HandlerContext};
use anyhow::{anyhow, Result};
use devrpc_shared::{now_ms, DeviceErrorKind, Frame, RpcId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

/// Result of running a method
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResult {
    /// Method ran; `response` becomes the reply payload
    Completed { response: Option<Value> },
    /// Method refused or failed
    Failed {
        kind: DeviceErrorKind,
        message: String,
    },
}

/// A request as received from the server
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRpc {
    pub id: RpcId,
    pub method: String,
    pub params: String,
    pub one_way: bool,
    pub expiration_time: u64,
}

impl IncomingRpc {
    /// Extract the request from a frame, `None` for any other frame
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Request {
                id,
                method,
                params,
                one_way,
                expiration_time,
            } => Some(Self {
                id,
                method,
                params,
                one_way,
                expiration_time,
            }),
            _ => None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expiration_time > 0 && now_ms() >= self.expiration_time
    }
}

/// Executes requests received from the server
pub struct RpcExecutor {
    device_id: String,
    started: Instant,
    values: Arc<RwLock<HashMap<String, Value>>>,
    in_flight: Arc<AtomicU32>,
}

impl RpcExecutor {
    /// Create a new executor; `in_flight` is reported in heartbeats
    pub fn new(device_id: String, in_flight: Arc<AtomicU32>) -> Self {
        Self {
            device_id,
            started: Instant::now(),
            values: Arc::new(RwLock::new(HashMap::new())),
            in_flight,
        }
    }

    /// Acknowledge and run `rpc`, writing the reply frames to `out`
    ///
    /// Expired requests are dropped without an Ack; the server has already
    /// timed them out.
    pub async fn execute(&self, rpc: &IncomingRpc, out: &mpsc::Sender<Frame>) -> Result<()> {
        if rpc.is_expired() {
            warn!("Dropping expired request {} ({})", rpc.id, rpc.method);
            return Ok(());
        }

        info!("Executing rpc: id={} method={}", rpc.id, rpc.method);
        send(out, Frame::Ack { id: rpc.id }).await?;

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.run(rpc).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        let reply = match result {
            RpcResult::Completed { response } => {
                info!("  Request {} completed", rpc.id);
                Frame::reply(rpc.id, response.map(|value| value.to_string()))
            }
            RpcResult::Failed { kind, message } => {
                warn!("  Request {} failed ({}): {}", rpc.id, kind, message);
                Frame::error(rpc.id, kind)
            }
        };

        if rpc.one_way {
            return Ok(());
        }
        send(out, reply).await
    }

    async fn run(&self, rpc: &IncomingRpc) -> RpcResult {
        let params = if rpc.params.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&rpc.params) {
                Ok(params) => params,
                Err(e) => {
                    return RpcResult::Failed {
                        kind: DeviceErrorKind::Rejected,
                        message: format!("Parameters are not JSON: {}", e),
                    };
                }
            }
        };

        let ctx = HandlerContext {
            device_id: self.device_id.clone(),
            uptime: self.started.elapsed(),
            values: self.values.clone(),
        };

        match rpc.method.as_str() {
            "getStatus" => handlers::handle_get_status(&ctx, &params).await,
            "getValue" => handlers::handle_get_value(&ctx, &params).await,
            "setValue" => handlers::handle_set_value(&ctx, &params).await,
            "echo" => handlers::handle_echo(&ctx, &params).await,
            other => RpcResult::Failed {
                kind: DeviceErrorKind::NotFound,
                message: format!("Unknown method {}", other),
            },
        }
    }
}

async fn send(out: &mpsc::Sender<Frame>, frame: Frame) -> Result<()> {
    out.send(frame)
        .await
        .map_err(|_| anyhow!("Connection closed"))
}
