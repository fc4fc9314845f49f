//! The backend worker task.
//!
//! One worker = one listener. Readiness is published through a oneshot
//! as soon as the listener is bound, so the manager never has to poll
//! for a port. Shutdown arrives on a watch channel and drains through
//! axum's graceful shutdown.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

use cachemesh_core::{epoch_millis, ServerId};

use crate::request_monitor::RequestMonitor;

#[derive(Clone)]
struct WorkerState {
    id: ServerId,
    monitor: Arc<RequestMonitor>,
}

/// Build the worker's router: telemetry plus opaque resource serving.
fn worker_router(id: ServerId, monitor: Arc<RequestMonitor>) -> Router {
    Router::new()
        .route("/capacity-factor", get(capacity_factor))
        .fallback(serve_resource)
        .with_state(WorkerState { id, monitor })
}

/// `GET /capacity-factor` — the telemetry contract polled by the
/// server monitor.
async fn capacity_factor(State(state): State<WorkerState>) -> Json<serde_json::Value> {
    let cf = state.monitor.capacity_factor(epoch_millis());
    Json(serde_json::json!({ "capacity_factor": cf }))
}

/// Any other request: treat the final path segment as the resource
/// name and answer with a deterministic body. The processing interval
/// is recorded for the capacity factor.
async fn serve_resource(State(state): State<WorkerState>, req: Request) -> String {
    let start_ms = epoch_millis();
    let resource = req
        .uri()
        .path()
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
        .to_string();
    let body = format!("server {}: resource '{}'\n", state.id, resource);
    state.monitor.record(start_ms, epoch_millis());
    body
}

/// Run a backend worker until `shutdown` fires.
///
/// Binds `127.0.0.1:port` (port 0 picks an ephemeral port), then sends
/// the bound port — or the bind error — through `ready_tx`.
pub async fn run_backend(
    id: ServerId,
    port: u16,
    record_ttl_ms: u64,
    ready_tx: oneshot::Sender<std::io::Result<u16>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(server_id = id, port, error = %e, "backend failed to bind");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let bound_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let monitor = Arc::new(RequestMonitor::new(record_ttl_ms));
    let router = worker_router(id, monitor);

    if ready_tx.send(Ok(bound_port)).is_err() {
        // Manager gave up while we were binding.
        debug!(server_id = id, "backend readiness receiver dropped");
        return;
    }
    info!(server_id = id, port = bound_port, "backend listening");

    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(e) = serve.await {
        error!(server_id = id, error = %e, "backend server error");
    }
    info!(server_id = id, port = bound_port, "backend stopped");
}
