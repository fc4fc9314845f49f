//! Co-located cluster integration tests.
//!
//! Wires the real subsystems together the way the daemon does —
//! manager, control API, monitor, ring, redistributor, dispatcher —
//! and drives them through the dispatcher router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use cachemesh_balancer::{dispatcher_router, BackendTable, CacheRedistributor, DispatcherState};
use cachemesh_core::Config;
use cachemesh_manager::{control_router, CacheServerManager};
use cachemesh_monitor::ServerMonitor;
use cachemesh_ring::HashRing;

struct Cluster {
    manager: Arc<CacheServerManager>,
    monitor: Arc<ServerMonitor>,
    ring: Arc<HashRing>,
    table: Arc<BackendTable>,
    redistributor: CacheRedistributor,
    dispatcher: axum::Router,
}

/// Stand up every subsystem except the background loops, which tests
/// drive tick by tick.
async fn cluster(port_range_start: u16, initial_backends: u32) -> Cluster {
    let config = Config {
        port_range_start,
        port_range_end: port_range_start + 20,
        shutdown_grace_ms: 2_000,
        ..Config::default()
    };

    let monitor = Arc::new(ServerMonitor::new(config.telemetry_timeout()));
    let manager = Arc::new(CacheServerManager::new(config.clone(), Arc::clone(&monitor)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let manager_port = listener.local_addr().unwrap().port();
    let control = control_router(Arc::clone(&manager));
    tokio::spawn(async move {
        axum::serve(listener, control).await.unwrap();
    });

    assert_eq!(
        manager.start_backends(initial_backends).await,
        initial_backends as usize
    );

    let ring = Arc::new(HashRing::new(
        config.ring_size,
        config.hash_function,
        config.angle_seed,
    ));
    let table = Arc::new(BackendTable::new());
    let redistributor = CacheRedistributor::new(
        Arc::clone(&ring),
        Arc::clone(&table),
        manager_port,
        &config,
    );

    let dispatcher = dispatcher_router(DispatcherState {
        ring: Arc::clone(&ring),
        table: Arc::clone(&table),
        manager_port,
        upstream_timeout: config.telemetry_timeout(),
    });

    Cluster {
        manager,
        monitor,
        ring,
        table,
        redistributor,
        dispatcher,
    }
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn full_stack_routes_requests_to_the_fleet() {
    let cluster = cluster(38_500, 3).await;
    cluster.redistributor.tick().await;

    assert_eq!(cluster.ring.angle_count(), 30);
    assert_eq!(cluster.table.len(), 3);

    let resp = cluster
        .dispatcher
        .clone()
        .oneshot(Request::get("/api/foo").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_string(resp).await;
    assert!(body.contains("resource 'foo'"), "body = {body}");

    // The same key always lands on the same worker.
    let owner = cluster.ring.find_server_id("foo").unwrap();
    for _ in 0..3 {
        let resp = cluster
            .dispatcher
            .clone()
            .oneshot(Request::get("/api/foo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_string(resp).await.contains(&format!("server {owner}")));
    }

    // A keyless path is the client's fault.
    let resp = cluster
        .dispatcher
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    cluster.manager.shutdown_all().await;
}

#[tokio::test]
async fn telemetry_and_modulation_grow_the_fleet() {
    let cluster = cluster(38_530, 2).await;
    cluster.redistributor.tick().await;

    // A real poll cycle samples every live worker.
    cluster.monitor.ping_all().await;
    let snapshot = cluster.monitor.snapshot();
    assert!(snapshot
        .values()
        .all(|info| info.current_capacity_factor.is_some()));

    // Pretend the fleet is overloaded; one tick adds round(0.3*5) = 2.
    for (&id, _) in snapshot.iter() {
        cluster.monitor.record_sample(id, 1_000, 0.8).unwrap();
    }
    cluster.manager.modulate().await;
    assert_eq!(cluster.manager.active_count().await, 4);

    // The next redistribution puts the newcomers on the ring.
    cluster.redistributor.tick().await;
    assert_eq!(cluster.ring.servers_with_angles(), 4);

    cluster.manager.shutdown_all().await;
}

#[tokio::test]
async fn retired_fleet_drains_the_ring_and_requests_get_503() {
    let cluster = cluster(38_560, 2).await;
    cluster.redistributor.tick().await;
    assert_eq!(cluster.ring.servers_with_angles(), 2);

    cluster.manager.shutdown_all().await;
    assert_eq!(cluster.manager.free_port_count().await, 20);
    assert_eq!(cluster.monitor.active_count(), 0);

    // The next tick sees an empty table and evicts everyone.
    cluster.redistributor.tick().await;
    assert_eq!(cluster.ring.angle_count(), 0);

    let resp = cluster
        .dispatcher
        .oneshot(Request::get("/api/foo").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn dispatcher_refreshes_its_table_inline_on_a_miss() {
    let cluster = cluster(38_590, 1).await;
    cluster.redistributor.tick().await;

    // Drop the table out from under the dispatcher; the ring still
    // names the worker, so the handler re-pulls from the manager.
    cluster.table.replace(Default::default());

    let resp = cluster
        .dispatcher
        .clone()
        .oneshot(Request::get("/api/foo").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    cluster.manager.shutdown_all().await;
}
