//! HTTP boundary
//!
//! Routes:
//! - `POST /api/rpc/oneway/:device_id`, `POST /api/rpc/twoway/:device_id` (408/409 fixed)
//! - `POST /api/rpc/v1/oneway/:device_id`, `POST /api/rpc/v1/twoway/:device_id`
//!   (statuses from `[status.v1]`)
//! - `GET /api/rpc/persistent/:rpc_id`
//! - `GET /health`

mod body;
mod handlers;

pub use body::{BodyError, RpcRequestBody};

use crate::config::{ConfigError, ServerConfig, SurfaceStatus};
use crate::rpc::{OutcomeClassifier, RpcDispatcher};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use devrpc_shared::DeviceErrorKind;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<RpcDispatcher>,
    pub default_tenant: Arc<str>,
    pub legacy: Arc<OutcomeClassifier<StatusCode>>,
    pub v1: Arc<OutcomeClassifier<StatusCode>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<RpcDispatcher>, config: &ServerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            dispatcher,
            default_tenant: Arc::from(config.default_tenant.as_str()),
            legacy: Arc::new(status_classifier(
                StatusCode::REQUEST_TIMEOUT,
                StatusCode::CONFLICT,
            )),
            v1: Arc::new(surface_classifier(&config.status.v1)?),
        })
    }
}

fn surface_classifier(surface: &SurfaceStatus) -> Result<OutcomeClassifier<StatusCode>, ConfigError> {
    Ok(status_classifier(
        surface.timeout_status()?,
        surface.no_connection_status()?,
    ))
}

/// Status mapping shared by both surfaces; only timeout and no-connection differ
pub fn status_classifier(
    timeout: StatusCode,
    no_connection: StatusCode,
) -> OutcomeClassifier<StatusCode> {
    OutcomeClassifier::new(
        StatusCode::OK,
        timeout,
        no_connection,
        StatusCode::BAD_GATEWAY,
        StatusCode::SERVICE_UNAVAILABLE,
    )
    .with_device_error(DeviceErrorKind::NotFound, StatusCode::NOT_FOUND)
    .with_device_error(DeviceErrorKind::Forbidden, StatusCode::FORBIDDEN)
    .with_device_error(DeviceErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR)
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/rpc/oneway/:device_id", post(handlers::legacy_one_way))
        .route("/api/rpc/twoway/:device_id", post(handlers::legacy_two_way))
        .route("/api/rpc/v1/oneway/:device_id", post(handlers::v1_one_way))
        .route("/api/rpc/v1/twoway/:device_id", post(handlers::v1_two_way))
        .route("/api/rpc/persistent/:rpc_id", get(handlers::persistent_rpc))
        .route("/health", get(handlers::health_check))
        .with_state(state)
}
