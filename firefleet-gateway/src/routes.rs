//! Axum route handlers for the firefleet gateway API.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use firefleet_core::{CreateVmRequest, OwnerId, VmId};
use firefleet_engine::VmOrchestrator;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::GatewayError;

// ── Shared state ─────────────────────────────────────────────────────────────

type Engine = Arc<VmOrchestrator>;

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router around a wired engine.
pub fn create_router(engine: Engine) -> Router {
    Router::new()
        .route("/create_vm", post(create_vm))
        .route("/delete_vm/{vm_id}", delete(delete_vm))
        .route("/get_all_vms", get(get_all_vms))
        .route("/get_user_vms/{user_id}", get(get_user_vms))
        .route("/get_vm_stats/{vm_id}", post(get_vm_stats))
        .route("/health", get(health))
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// `POST /create_vm`: provision a VM and wait until it is running.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] for a malformed body; engine
/// failures are passed through after the engine has rolled back.
pub async fn create_vm(
    State(engine): State<Engine>,
    body: Result<Json<CreateVmRequest>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(request) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let created = engine.create(&request).await?;
    tracing::info!(vm_id = %created.vm_id, port = created.port, "vm created");
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "vm_id": created.vm_id,
            "port": created.port,
            "socket_path": created.socket_path,
        })),
    ))
}

/// `DELETE /delete_vm/{vm_id}`: tear a VM down and forget it.
///
/// # Errors
/// Returns `404` if the VM is unknown. Collaborator failures during teardown
/// are reported under `warnings` in a successful response.
pub async fn delete_vm(
    State(engine): State<Engine>,
    Path(vm_id): Path<VmId>,
) -> Result<impl IntoResponse, GatewayError> {
    let report = engine.delete(vm_id).await?;
    Ok(Json(json!({
        "status": "success",
        "vm_id": report.vm_id,
        "warnings": report.warnings,
    })))
}

/// `GET /get_all_vms`
///
/// # Errors
/// Returns `500` if the registry cannot be read.
pub async fn get_all_vms(State(engine): State<Engine>) -> Result<impl IntoResponse, GatewayError> {
    let vms = engine.list(None)?;
    Ok(Json(json!({"status": "success", "vms": vms})))
}

/// `GET /get_user_vms/{user_id}`
///
/// # Errors
/// Returns `500` if the registry cannot be read.
pub async fn get_user_vms(
    State(engine): State<Engine>,
    Path(user_id): Path<OwnerId>,
) -> Result<impl IntoResponse, GatewayError> {
    let vms = engine.list(Some(user_id))?;
    Ok(Json(json!({"status": "success", "user_id": user_id, "vms": vms})))
}

/// `POST /get_vm_stats/{vm_id}`: ask the hypervisor to flush its metrics
/// file.
///
/// # Errors
/// Returns `404` for an unknown VM and `502` if the control socket does not
/// answer.
pub async fn get_vm_stats(
    State(engine): State<Engine>,
    Path(vm_id): Path<VmId>,
) -> Result<impl IntoResponse, GatewayError> {
    engine.flush_stats(vm_id).await?;
    Ok(Json(json!({"status": "success", "vm_id": vm_id})))
}
