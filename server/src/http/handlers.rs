//! RPC request handlers

use super::body::RpcRequestBody;
use super::AppState;
use crate::rpc::{OutcomeClassifier, RpcDispatcher, SubmitError};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use devrpc_shared::RpcId;
use std::sync::Arc;
use tracing::{debug, warn};

const TENANT_HEADER: &str = "x-tenant-id";

pub async fn legacy_one_way(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let classifier = state.legacy.clone();
    handle_rpc(&state, &classifier, device_id, true, &headers, &body).await
}

pub async fn legacy_two_way(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let classifier = state.legacy.clone();
    handle_rpc(&state, &classifier, device_id, false, &headers, &body).await
}

pub async fn v1_one_way(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let classifier = state.v1.clone();
    handle_rpc(&state, &classifier, device_id, true, &headers, &body).await
}

pub async fn v1_two_way(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let classifier = state.v1.clone();
    handle_rpc(&state, &classifier, device_id, false, &headers, &body).await
}

fn tenant(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.default_tenant.to_string())
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Cancels the call if the handler future is dropped before the outcome arrives
struct CancelOnDrop {
    dispatcher: Arc<RpcDispatcher>,
    id: RpcId,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.dispatcher.cancel(self.id) {
            debug!("Client went away, call {} cancelled", self.id);
        }
    }
}

async fn handle_rpc(
    state: &AppState,
    classifier: &OutcomeClassifier<StatusCode>,
    device_id: String,
    one_way: bool,
    headers: &HeaderMap,
    raw: &str,
) -> Response {
    let body = match RpcRequestBody::parse(raw) {
        Ok(body) => body,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let persistent = body.persistent.unwrap_or(false);
    let submit = body.into_submit(tenant(state, headers), device_id, one_way);
    let call = match state.dispatcher.submit(submit).await {
        Ok(call) => call,
        Err(SubmitError::Malformed(reason)) => {
            return error_body(StatusCode::BAD_REQUEST, reason);
        }
        Err(SubmitError::DuplicateId(id)) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "request id is already pending",
                    "requestUUID": id,
                })),
            )
                .into_response();
        }
        Err(e @ SubmitError::ShuttingDown) => {
            return error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let id = call.id();

    // Persistent calls are tracked through the audit store, not the HTTP response
    if persistent {
        debug!("Accepted persistent call {}", id);
        return Json(serde_json::json!({ "rpcId": id })).into_response();
    }

    let guard = CancelOnDrop {
        dispatcher: state.dispatcher.clone(),
        id,
        armed: true,
    };
    let outcome = call.outcome().await;
    guard.disarm();

    let classified = classifier.classify(&outcome);
    if classified.format_error {
        warn!("Device reply for {} is not valid JSON", id);
    }
    match classified.payload {
        Some(payload) => (
            classified.status,
            [(header::CONTENT_TYPE, "application/json")],
            payload,
        )
            .into_response(),
        None => classified.status.into_response(),
    }
}

/// Look up the audit record of a persisted call
pub async fn persistent_rpc(
    State(state): State<AppState>,
    Path(rpc_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let id: RpcId = match rpc_id.parse() {
        Ok(id) => id,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, format!("invalid rpc id: {}", rpc_id)),
    };

    match state.dispatcher.store().get(&tenant(&state, &headers), id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("Lookup of rpc {} failed: {}", id, e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "devrpc-server",
        "version": env!("CARGO_PKG_VERSION"),
        "pendingCalls": state.dispatcher.pending_count(),
    }))
}
