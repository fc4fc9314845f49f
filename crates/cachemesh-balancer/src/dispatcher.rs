//! The client-facing request handler.
//!
//! Stateless per request: resolve the resource key to a server id via
//! the ring, the id to a port via the table snapshot, forward, and
//! mirror the backend's response. Failure mapping: missing key -> 400,
//! empty ring or unknown id -> 503, upstream I/O -> 502.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, warn};

use cachemesh_ring::{HashRing, RingError};

use crate::table::BackendTable;
use crate::upstream::{fetch_server_table, forward_request};

#[derive(Clone)]
pub struct DispatcherState {
    pub ring: Arc<HashRing>,
    pub table: Arc<BackendTable>,
    /// Where the manager's control API lives, for the inline refresh
    /// on a table miss.
    pub manager_port: u16,
    pub upstream_timeout: Duration,
}

/// Build the dispatcher router: every method and path funnels through
/// the single dispatch handler.
pub fn dispatcher_router(state: DispatcherState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Final non-empty path segment, if any.
fn resource_key(path: &str) -> Option<&str> {
    path.rsplit('/').find(|segment| !segment.is_empty())
}

async fn dispatch(State(state): State<DispatcherState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let key = match resource_key(parts.uri.path()) {
        Some(key) => key.to_string(),
        None => {
            return (StatusCode::BAD_REQUEST, "missing resource key\n").into_response();
        }
    };

    let server_id = match state.ring.find_server_id(&key) {
        Ok(id) => id,
        Err(RingError::Empty) => {
            warn!(key = %key, "no backend available: ring is empty");
            return (StatusCode::SERVICE_UNAVAILABLE, "no backend available\n").into_response();
        }
        Err(e) => {
            warn!(key = %key, error = %e, "ring lookup failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "no backend available\n").into_response();
        }
    };

    // The ring can briefly be ahead of the table (or vice versa) while
    // the redistribution loop runs; refresh once before giving up.
    let entry = match state.table.get(server_id) {
        Some(entry) if entry.port != 0 => entry,
        _ => {
            match fetch_server_table(state.manager_port, state.upstream_timeout).await {
                Ok(fresh) => state.table.replace(fresh),
                Err(e) => debug!(error = %e, "inline server table refresh failed"),
            }
            match state.table.get(server_id) {
                Some(entry) if entry.port != 0 => entry,
                _ => {
                    warn!(server_id, key = %key, "server id has no routable port");
                    return (StatusCode::SERVICE_UNAVAILABLE, "no backend available\n")
                        .into_response();
                }
            }
        }
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("unreadable body: {e}\n")).into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match forward_request(
        entry.port,
        parts.method,
        path_and_query,
        body_bytes,
        state.upstream_timeout,
    )
    .await
    {
        Ok((status, bytes)) => Response::builder()
            .status(status)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
        Err(e) => {
            warn!(server_id, port = entry.port, error = %e, "upstream request failed");
            (StatusCode::BAD_GATEWAY, "upstream error\n").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;
    use cachemesh_core::{HashFunctionId, ServerEntry, ServerId};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tokio::sync::{oneshot, watch};
    use tower::ServiceExt;

    fn test_state(ring: Arc<HashRing>, table: Arc<BackendTable>) -> DispatcherState {
        DispatcherState {
            ring,
            table,
            // Closed port: inline refreshes fail fast in tests.
            manager_port: 1,
            upstream_timeout: Duration::from_millis(500),
        }
    }

    fn entry(port: u16) -> ServerEntry {
        ServerEntry {
            port,
            capacity_factor: 0.0,
            active: true,
        }
    }

    async fn spawn_worker(id: ServerId) -> (u16, watch::Sender<bool>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(cachemesh_server::run_backend(
            id, 0, 10_000, ready_tx, shutdown_rx,
        ));
        let port = ready_rx.await.unwrap().unwrap();
        (port, shutdown_tx)
    }

    async fn body_string(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn resource_key_takes_the_final_segment() {
        assert_eq!(resource_key("/api/foo"), Some("foo"));
        assert_eq!(resource_key("/api/foo/"), Some("foo"));
        assert_eq!(resource_key("/foo"), Some("foo"));
        assert_eq!(resource_key("/"), None);
        assert_eq!(resource_key(""), None);
    }

    #[tokio::test]
    async fn request_without_key_is_400() {
        let ring = Arc::new(HashRing::new(1 << 16, HashFunctionId::Fnv1a32, 1));
        let router = dispatcher_router(test_state(ring, Arc::new(BackendTable::new())));

        let resp = router
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_ring_is_503() {
        let ring = Arc::new(HashRing::new(1 << 16, HashFunctionId::Fnv1a32, 1));
        let router = dispatcher_router(test_state(ring, Arc::new(BackendTable::new())));

        let resp = router
            .oneshot(HttpRequest::get("/api/foo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_server_id_after_refresh_is_503() {
        let ring = Arc::new(HashRing::new(1 << 16, HashFunctionId::Fnv1a32, 1));
        ring.add_server(1);
        ring.add_angle(1, 10).unwrap();

        // Table never learns about server 1; refresh target is closed.
        let router = dispatcher_router(test_state(ring, Arc::new(BackendTable::new())));

        let resp = router
            .oneshot(HttpRequest::get("/api/foo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    // Port 0 is never routable, even if a bogus entry appears.
    #[tokio::test]
    async fn port_zero_entry_is_treated_as_missing() {
        let ring = Arc::new(HashRing::new(1 << 16, HashFunctionId::Fnv1a32, 1));
        ring.add_server(1);
        ring.add_angle(1, 10).unwrap();

        let table = Arc::new(BackendTable::new());
        table.replace(HashMap::from([(1, entry(0))]));
        let router = dispatcher_router(test_state(ring, table));

        let resp = router
            .oneshot(HttpRequest::get("/api/foo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn single_server_ring_serves_every_key_end_to_end() {
        let (port, _shutdown) = spawn_worker(1).await;

        let ring = Arc::new(HashRing::new(1 << 16, HashFunctionId::Fnv1a32, 42));
        ring.add_server(1);
        ring.add_angle(1, 10).unwrap();
        assert_eq!(ring.find_server_id("foo"), Ok(1));
        assert_eq!(ring.find_server_id("bar"), Ok(1));

        let table = Arc::new(BackendTable::new());
        table.replace(HashMap::from([(1, entry(port))]));
        let router = dispatcher_router(test_state(ring, table));

        let resp = router
            .clone()
            .oneshot(HttpRequest::get("/api/foo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("server 1"));
        assert!(body.contains("'foo'"));

        let resp = router
            .oneshot(HttpRequest::get("/api/bar").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.contains("'bar'"));
    }

    // One dead backend turns into a 502 for its keys only; keys owned
    // by a live backend keep working.
    #[tokio::test]
    async fn upstream_failure_is_502_and_isolated() {
        let (live_port, _shutdown) = spawn_worker(2).await;

        let ring = Arc::new(HashRing::new(1 << 16, HashFunctionId::Fnv1a32, 42));
        ring.add_server(1);
        ring.add_angle(1, 10).unwrap();
        ring.add_server(2);
        ring.add_angle(2, 10).unwrap();

        let table = Arc::new(BackendTable::new());
        table.replace(HashMap::from([(1, entry(1)), (2, entry(live_port))]));
        let router = dispatcher_router(test_state(Arc::clone(&ring), table));

        // Find one key per owner.
        let mut dead_key = None;
        let mut live_key = None;
        for i in 0..1000 {
            let key = format!("key-{i}");
            match ring.find_server_id(&key).unwrap() {
                1 if dead_key.is_none() => dead_key = Some(key),
                2 if live_key.is_none() => live_key = Some(key),
                _ => {}
            }
            if dead_key.is_some() && live_key.is_some() {
                break;
            }
        }
        let dead_key = dead_key.expect("no key mapped to server 1");
        let live_key = live_key.expect("no key mapped to server 2");

        let resp = router
            .clone()
            .oneshot(
                HttpRequest::get(format!("/api/{dead_key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp = router
            .oneshot(
                HttpRequest::get(format!("/api/{live_key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
