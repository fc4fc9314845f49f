//! The manager's control API.
//!
//! Served on an ephemeral loopback port published to the balancer,
//! which pulls `GET /cache-servers` every redistribution tick. The
//! POST/DELETE routes exist for operational poking and tests.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use tracing::warn;

use cachemesh_core::ServerId;

use crate::manager::{CacheServerManager, ManagerError};

#[derive(Clone)]
pub struct ControlState {
    pub manager: Arc<CacheServerManager>,
}

/// Build the control-plane router.
pub fn control_router(manager: Arc<CacheServerManager>) -> Router {
    Router::new()
        .route("/cache-servers", get(list_servers).post(start_server))
        .route("/cache-servers/{id}", delete(stop_server))
        .with_state(ControlState { manager })
}

fn error_response(status: StatusCode, msg: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": msg }))).into_response()
}

/// `GET /cache-servers` — the currently tracked (active) fleet, keyed
/// by server id.
async fn list_servers(State(state): State<ControlState>) -> impl IntoResponse {
    let snapshot = state.manager.monitor().snapshot();
    let mut servers = serde_json::Map::new();
    for (id, info) in snapshot {
        if info.active {
            servers.insert(
                id.to_string(),
                serde_json::json!({
                    "port": info.port,
                    "capacityFactor": info.current_or_zero(),
                    "active": info.active,
                }),
            );
        }
    }
    Json(serde_json::Value::Object(servers))
}

/// `POST /cache-servers` — start one backend.
async fn start_server(State(state): State<ControlState>) -> impl IntoResponse {
    match state.manager.start_backend().await {
        Ok(started) => Json(started).into_response(),
        Err(ManagerError::NoFreePort) => {
            warn!("control API: no free port for new backend");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "no free port")
        }
        Err(e) => {
            warn!(error = %e, "control API: backend start failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// `DELETE /cache-servers/{id}` — stop one backend; 404 if unknown.
async fn stop_server(
    State(state): State<ControlState>,
    Path(id): Path<ServerId>,
) -> impl IntoResponse {
    match state.manager.stop_backend(id).await {
        Ok(()) => Json(serde_json::json!({ "id": id })).into_response(),
        Err(ManagerError::UnknownServer(_)) => {
            error_response(StatusCode::NOT_FOUND, "unknown server")
        }
        Err(e) => {
            warn!(server_id = id, error = %e, "control API: backend stop failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
