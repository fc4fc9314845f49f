//! Worker lifecycle and the modulation loop.
//!
//! All structural mutation of the fleet goes through one async mutex,
//! so a start and a stop can never interleave. Ports only return to
//! the free pool once their worker has confirmed exit (or been
//! force-aborted after the grace window).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cachemesh_core::{epoch_secs, Config, ServerId, StartedServer};
use cachemesh_monitor::{MonitorError, ServerMonitor};
use cachemesh_server::run_backend;

/// Manager failures. `NoFreePort` is transient (the modulation loop
/// retries next tick); the rest indicate a failed or hung worker.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no free port available")]
    NoFreePort,

    #[error("backend {0} failed to start: {1}")]
    StartFailed(ServerId, String),

    #[error("backend {0} did not become ready in time")]
    StartTimeout(ServerId),

    #[error("unknown server {0}")]
    UnknownServer(ServerId),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

struct BackendHandle {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerState {
    server_table: HashMap<ServerId, BackendHandle>,
    free_ports: BTreeSet<u16>,
    id_counter: ServerId,
}

/// Starts, stops and resizes the cache server fleet.
pub struct CacheServerManager {
    state: Mutex<ManagerState>,
    monitor: Arc<ServerMonitor>,
    config: Config,
}

impl CacheServerManager {
    pub fn new(config: Config, monitor: Arc<ServerMonitor>) -> Self {
        let free_ports = (config.port_range_start..config.port_range_end).collect();
        Self {
            state: Mutex::new(ManagerState {
                server_table: HashMap::new(),
                free_ports,
                id_counter: 1,
            }),
            monitor,
            config,
        }
    }

    pub fn monitor(&self) -> &Arc<ServerMonitor> {
        &self.monitor
    }

    /// Number of workers currently running.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.server_table.len()
    }

    /// Ports currently available for allocation.
    pub async fn free_port_count(&self) -> usize {
        self.state.lock().await.free_ports.len()
    }

    /// Launch one worker: allocate the lowest free port, spawn the
    /// worker task, and wait for its listener to come up.
    ///
    /// Any failure on the way returns the port to the pool.
    pub async fn start_backend(&self) -> Result<StartedServer, ManagerError> {
        let mut state = self.state.lock().await;

        let port = match state.free_ports.pop_first() {
            Some(port) => port,
            None => return Err(ManagerError::NoFreePort),
        };
        let id = state.id_counter;
        state.id_counter += 1;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_backend(
            id,
            port,
            self.config.request_record_ttl_ms,
            ready_tx,
            shutdown_rx,
        ));

        match tokio::time::timeout(self.config.backend_ready_timeout(), ready_rx).await {
            Ok(Ok(Ok(bound_port))) => {
                self.monitor.add_server(id, bound_port, epoch_secs())?;
                state
                    .server_table
                    .insert(id, BackendHandle { port: bound_port, shutdown_tx, task });
                info!(server_id = id, port = bound_port, "backend started");
                Ok(StartedServer { id, port: bound_port })
            }
            Ok(Ok(Err(e))) => {
                state.free_ports.insert(port);
                Err(ManagerError::StartFailed(id, e.to_string()))
            }
            Ok(Err(_recv)) => {
                state.free_ports.insert(port);
                Err(ManagerError::StartFailed(
                    id,
                    "worker exited before readiness".to_string(),
                ))
            }
            Err(_elapsed) => {
                let _ = shutdown_tx.send(true);
                task.abort();
                state.free_ports.insert(port);
                Err(ManagerError::StartTimeout(id))
            }
        }
    }

    /// Retire one worker: signal shutdown, wait out the grace window,
    /// force-abort a hung worker, then recycle its port.
    pub async fn stop_backend(&self, id: ServerId) -> Result<(), ManagerError> {
        let mut state = self.state.lock().await;
        let mut handle = state
            .server_table
            .remove(&id)
            .ok_or(ManagerError::UnknownServer(id))?;

        // Retire in the monitor first so the poller stops touching it.
        if let Err(e) = self.monitor.deactivate_server(id, epoch_secs()) {
            warn!(server_id = id, error = %e, "monitor did not know stopping server");
        }

        let _ = handle.shutdown_tx.send(true);
        if tokio::time::timeout(self.config.shutdown_grace(), &mut handle.task)
            .await
            .is_err()
        {
            warn!(server_id = id, "backend ignored shutdown grace, aborting");
            handle.task.abort();
        }

        state.free_ports.insert(handle.port);
        info!(server_id = id, port = handle.port, "backend stopped");
        Ok(())
    }

    /// Stop up to `n` workers chosen uniformly at random.
    pub async fn stop_random_backends(&self, n: usize) -> usize {
        let mut stopped = 0;
        for _ in 0..n {
            let victim = {
                let state = self.state.lock().await;
                let ids: Vec<ServerId> = state.server_table.keys().copied().collect();
                if ids.is_empty() {
                    break;
                }
                ids[rand::thread_rng().gen_range(0..ids.len())]
            };
            match self.stop_backend(victim).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(server_id = victim, error = %e, "failed to stop backend"),
            }
        }
        stopped
    }

    /// Start `n` workers, e.g. the initial fleet. Returns how many
    /// actually came up.
    pub async fn start_backends(&self, n: u32) -> usize {
        let mut started = 0;
        for _ in 0..n {
            match self.start_backend().await {
                Ok(_) => started += 1,
                Err(e) => warn!(error = %e, "backend start failed"),
            }
        }
        started
    }

    /// One modulation tick: compare the fleet's mean capacity factor
    /// to the target and start/stop `round(diff * growth_rate)`
    /// workers. The fleet never drops below one worker.
    pub async fn modulate(&self) {
        let avg = self.monitor.average_capacity_factor();
        let diff = avg - self.config.target_cf;
        let delta = (diff * self.config.growth_rate).round() as i64;

        if delta > 0 {
            debug!(avg, delta, "modulation: scaling up");
            for _ in 0..delta {
                match self.start_backend().await {
                    Ok(started) => {
                        debug!(server_id = started.id, port = started.port, "scaled up");
                    }
                    Err(ManagerError::NoFreePort) => {
                        warn!("modulation: port pool exhausted, retrying next tick");
                        break;
                    }
                    Err(e) => warn!(error = %e, "modulation: backend start failed"),
                }
            }
        } else if delta < 0 {
            let active = self.active_count().await;
            // Keep at least one worker so the ring never empties.
            let bounded = ((-delta) as usize).min(active.saturating_sub(1));
            if bounded > 0 {
                debug!(avg, stopping = bounded, "modulation: scaling down");
                self.stop_random_backends(bounded).await;
            }
        }

        self.monitor
            .update_server_count(epoch_secs(), self.active_count().await);
    }

    /// The modulation loop.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = interval.as_millis() as u64,
            target_cf = self.config.target_cf,
            growth_rate = self.config.growth_rate,
            "modulation loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.modulate().await;
                }
                _ = shutdown.changed() => {
                    info!("modulation loop shutting down");
                    break;
                }
            }
        }
    }

    /// Stop the whole fleet: signal every worker, then join each with
    /// the grace window, recycling ports as they exit.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.lock().await;
        let handles: Vec<(ServerId, BackendHandle)> = state.server_table.drain().collect();

        for (_, handle) in &handles {
            let _ = handle.shutdown_tx.send(true);
        }

        for (id, mut handle) in handles {
            let _ = self.monitor.deactivate_server(id, epoch_secs());
            if tokio::time::timeout(self.config.shutdown_grace(), &mut handle.task)
                .await
                .is_err()
            {
                warn!(server_id = id, "backend ignored shutdown grace, aborting");
                handle.task.abort();
            }
            state.free_ports.insert(handle.port);
        }
        info!("all backends stopped");
    }
}
