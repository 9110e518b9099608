//! Axum-based operator API.
//!
//! Provides REST endpoints for:
//! - Liveness and pool inspection
//! - Dispatching a task to its validator sandbox
//! - Evicting a validator type
//! - Attesting a pooled sandbox
//! - Reading a sandbox's sealed document

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::attestation::AttestationVerifier;
use crate::error::{SandboxError, TaskHandlerErrorKind, TransportErrorKind};
use crate::router::TaskRouter;
use crate::sandbox::{Task, ValidatorType};
use crate::sealed::SealedStore;

#[derive(Clone)]
pub struct ApiState {
    pub router: Arc<TaskRouter>,
    pub verifier: Option<Arc<AttestationVerifier>>,
    pub sealed: SealedStore,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

fn status_for(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::Validation(_) | SandboxError::UnsupportedProfile(_) => {
            StatusCode::BAD_REQUEST
        }
        SandboxError::Transport(TransportErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        SandboxError::Transport(_)
        | SandboxError::TaskHandler(TaskHandlerErrorKind::BadStatus(_))
        | SandboxError::TaskHandler(TaskHandlerErrorKind::BadShape(_)) => StatusCode::BAD_GATEWAY,
        SandboxError::Provider(_)
        | SandboxError::HealthCheckTimeout { .. }
        | SandboxError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        SandboxError::Attestation(_)
        | SandboxError::CapacityInvariantViolation { .. }
        | SandboxError::ImageBuild(_)
        | SandboxError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn from_sandbox_error(err: SandboxError) -> Response {
    api_error(status_for(&err), err.to_string())
}

fn parse_type(raw: &str) -> Result<ValidatorType, Response> {
    ValidatorType::new(raw).map_err(from_sandbox_error)
}

// ---------------------------------------------------------------------------
// Pool endpoints
// ---------------------------------------------------------------------------

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let pool = state.router.pool();
    Json(json!({
        "status": "ok",
        "backend": pool.lifecycle().provider().backend_name(),
        "sandboxes": pool.len(),
        "capacity": pool.capacity(),
        "attestation": state.verifier.is_some(),
    }))
}

async fn list_pool(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "sandboxes": state.router.pool().snapshot() }))
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot: BTreeMap<String, u64> = state
        .router
        .pool()
        .metrics()
        .snapshot()
        .into_iter()
        .collect();
    Json(json!({ "metrics": snapshot }))
}

async fn evict(State(state): State<ApiState>, Path(raw): Path<String>) -> Response {
    let validator_type = match parse_type(&raw) {
        Ok(vt) => vt,
        Err(resp) => return resp,
    };
    match state.router.pool().evict(&validator_type).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => api_error(
            StatusCode::NOT_FOUND,
            format!("no pooled sandbox for {validator_type}"),
        ),
        Err(err) => from_sandbox_error(err),
    }
}

// ---------------------------------------------------------------------------
// Task dispatch
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TaskRequest {
    validator_type: String,
    data: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn dispatch_task(State(state): State<ApiState>, Json(req): Json<TaskRequest>) -> Response {
    let validator_type = match parse_type(&req.validator_type) {
        Ok(vt) => vt,
        Err(resp) => return resp,
    };
    let task = match req.timeout_ms {
        Some(0) => return api_error(StatusCode::BAD_REQUEST, "timeout_ms must be positive"),
        Some(ms) => Task::new(validator_type, req.data, Duration::from_millis(ms)),
        None => state.router.task(validator_type, req.data),
    };
    match state.router.dispatch(&task).await {
        Ok(is_valid) => Json(json!({ "is_valid": is_valid })).into_response(),
        Err(err) => from_sandbox_error(err),
    }
}

// ---------------------------------------------------------------------------
// Attestation
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AttestRequest {
    validator_type: String,
    #[serde(default)]
    expected_measurement: Option<String>,
}

async fn attest(State(state): State<ApiState>, Json(req): Json<AttestRequest>) -> Response {
    let Some(verifier) = state.verifier.clone() else {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "attestation is not configured",
        );
    };
    let validator_type = match parse_type(&req.validator_type) {
        Ok(vt) => vt,
        Err(resp) => return resp,
    };
    // Attest only what is already pooled; never create or evict for it.
    let Some(lease) = state.router.pool().lease_existing(&validator_type) else {
        return api_error(
            StatusCode::NOT_FOUND,
            format!("no pooled sandbox for {validator_type}"),
        );
    };
    let decision = verifier
        .verify(lease.sandbox(), req.expected_measurement.as_deref())
        .await;
    Json(decision).into_response()
}

// ---------------------------------------------------------------------------
// Sealed storage
// ---------------------------------------------------------------------------

async fn read_sealed(State(state): State<ApiState>, Path(raw): Path<String>) -> Response {
    let validator_type = match parse_type(&raw) {
        Ok(vt) => vt,
        Err(resp) => return resp,
    };
    let name = validator_type.sandbox_name(state.router.pool().config().hardware_isolation);
    match state.sealed.unseal(&name).await {
        Ok(data) => Json(json!({ "sandbox": name, "data": data })).into_response(),
        Err(err) => from_sandbox_error(err),
    }
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

/// Build the operator API router with all endpoints and CORS support.
pub fn operator_api_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Pool
        .route("/pool", get(list_pool))
        .route("/pool/{validator_type}", delete(evict))
        // Dispatch
        .route("/tasks", post(dispatch_task))
        // Attestation and sealed storage
        .route("/attest", post(attest))
        .route("/sealed/{validator_type}", get(read_sealed))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
