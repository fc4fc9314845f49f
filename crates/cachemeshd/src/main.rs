//! cachemeshd — the cachemesh daemon.
//!
//! Single co-located process composing the whole system:
//!
//! - the cache server fleet (one worker task per backend)
//! - the server monitor's telemetry poll loop
//! - the manager's modulation loop and control API
//! - the balancer's dispatcher and redistribution loop
//!
//! # Usage
//!
//! ```text
//! cachemeshd --port 8080 --initial-backends 39
//! cachemeshd --config cachemesh.toml --target-cf 0.6
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use cachemesh_balancer::{dispatcher_router, BackendTable, CacheRedistributor, DispatcherState};
use cachemesh_core::Config;
use cachemesh_manager::CacheServerManager;
use cachemesh_monitor::ServerMonitor;
use cachemesh_ring::HashRing;

#[derive(Parser)]
#[command(
    name = "cachemeshd",
    about = "Self-scaling consistent-hashing cache load balancer"
)]
struct Cli {
    /// Path to a TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client-facing dispatcher port.
    #[arg(long)]
    port: Option<u16>,

    /// Number of backends started before serving.
    #[arg(long)]
    initial_backends: Option<u32>,

    /// Mean capacity factor the autoscaler drives toward.
    #[arg(long)]
    target_cf: Option<f64>,

    /// Autoscaler gain per modulation tick.
    #[arg(long)]
    growth_rate: Option<f64>,

    /// Seed for the ring's angle draws.
    #[arg(long)]
    angle_seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cachemeshd=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.dispatcher_port = port;
    }
    if let Some(n) = cli.initial_backends {
        config.initial_backend_count = n;
    }
    if let Some(target_cf) = cli.target_cf {
        config.target_cf = target_cf;
    }
    if let Some(growth_rate) = cli.growth_rate {
        config.growth_rate = growth_rate;
    }
    if let Some(seed) = cli.angle_seed {
        config.angle_seed = seed;
    }
    config.validate()?;

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("cachemeshd starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Fleet management ───────────────────────────────────────

    let monitor = Arc::new(ServerMonitor::new(config.telemetry_timeout()));
    let manager = Arc::new(CacheServerManager::new(config.clone(), Arc::clone(&monitor)));

    // The control API lives on an ephemeral loopback port, published
    // to the balancer below.
    let control_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let manager_port = control_listener.local_addr()?.port();
    info!(manager_port, "control API listening");

    let control_router = cachemesh_manager::control_router(Arc::clone(&manager));
    let mut control_shutdown = shutdown_rx.clone();
    let control_handle = tokio::spawn(async move {
        let serve = axum::serve(control_listener, control_router).with_graceful_shutdown(
            async move {
                let _ = control_shutdown.changed().await;
            },
        );
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "control API server error");
        }
    });

    let started = manager.start_backends(config.initial_backend_count).await;
    info!(
        started,
        requested = config.initial_backend_count,
        "initial fleet started"
    );

    // ── Ring and balancer ──────────────────────────────────────

    let ring = Arc::new(HashRing::new(
        config.ring_size,
        config.hash_function,
        config.angle_seed,
    ));
    let table = Arc::new(BackendTable::new());
    let redistributor = Arc::new(CacheRedistributor::new(
        Arc::clone(&ring),
        Arc::clone(&table),
        manager_port,
        &config,
    ));
    // Seed the ring before the first client request lands.
    redistributor.tick().await;

    // ── Background loops ───────────────────────────────────────

    let redistribution_handle = tokio::spawn(
        Arc::clone(&redistributor).run(config.redistribution_interval(), shutdown_rx.clone()),
    );
    let modulation_handle = tokio::spawn(
        Arc::clone(&manager).run(config.modulation_interval(), shutdown_rx.clone()),
    );
    let poll_handle =
        tokio::spawn(Arc::clone(&monitor).run(config.poll_interval(), shutdown_rx.clone()));

    // ── Client-facing dispatcher ───────────────────────────────

    let dispatcher_state = DispatcherState {
        ring,
        table,
        manager_port,
        upstream_timeout: config.telemetry_timeout(),
    };
    let router = dispatcher_router(dispatcher_state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.dispatcher_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "dispatcher listening");

    let signal_tx = shutdown_tx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = signal_tx.send(true);
    });
    server.await?;

    // Cascade: the client listener is already drained; now the loops,
    // then the fleet, then the control API.
    let _ = redistribution_handle.await;
    let _ = modulation_handle.await;
    let _ = poll_handle.await;
    manager.shutdown_all().await;
    let _ = control_handle.await;

    info!("cachemeshd stopped");
    Ok(())
}
