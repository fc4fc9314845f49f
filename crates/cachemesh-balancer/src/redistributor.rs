//! The redistribution loop.
//!
//! Every tick: pull the manager's server table, put new servers on the
//! ring, evict vanished ones, then nudge per-server angle counts
//! against the configured load bands. The ring is never allowed to go
//! empty through a load-driven removal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use cachemesh_core::{epoch_secs, Config, ServerId};
use cachemesh_ring::HashRing;

use crate::table::BackendTable;
use crate::upstream::fetch_server_table;

/// Reweights the ring from the fleet's load telemetry.
pub struct CacheRedistributor {
    ring: Arc<HashRing>,
    table: Arc<BackendTable>,
    manager_port: u16,
    cutoffs: [f64; 4],
    initial_angles: u32,
    timeout: Duration,
}

impl CacheRedistributor {
    pub fn new(
        ring: Arc<HashRing>,
        table: Arc<BackendTable>,
        manager_port: u16,
        config: &Config,
    ) -> Self {
        Self {
            ring,
            table,
            manager_port,
            cutoffs: config.server_load_cutoffs,
            initial_angles: config.initial_angles_per_server,
            timeout: config.telemetry_timeout(),
        }
    }

    /// Pull a fresh server table from the manager. On failure the
    /// previous table stays in place and this tick works from it.
    pub async fn refresh_server_table(&self) -> bool {
        match fetch_server_table(self.manager_port, self.timeout).await {
            Ok(fresh) => {
                self.table.replace(fresh);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to pull server table from manager");
                false
            }
        }
    }

    /// Align ring membership with the table: register newcomers with
    /// their initial angles, evict servers the manager dropped.
    pub fn reconcile_ring(&self) {
        let table = self.table.snapshot();
        let known = self.ring.server_ids();

        for &id in table.keys() {
            if !known.contains(&id) {
                self.ring.add_server(id);
                match self.ring.add_angle(id, self.initial_angles) {
                    Ok(()) => debug!(server_id = id, angles = self.initial_angles, "server joined ring"),
                    Err(e) => warn!(server_id = id, error = %e, "could not place initial angles"),
                }
            }
        }

        for id in self.ring.server_ids() {
            if !table.contains_key(&id) {
                let removed = self.ring.remove_server(id);
                debug!(server_id = id, removed, "server left ring");
            }
        }
    }

    /// Apply the load bands to every known server.
    ///
    /// Below the band: add angles. Above it: shed angles, unless this
    /// server is the only one holding any (a single overloaded server
    /// beats an empty ring).
    pub fn remap_cache_keys(&self) {
        let [c0, c1, c2, c3] = self.cutoffs;
        for (id, entry) in self.table.snapshot() {
            let cf = entry.capacity_factor;
            if cf < c0 {
                self.add_angles(id, 3);
            } else if cf < c1 {
                self.add_angles(id, 1);
            } else if cf <= c2 {
                // In the target band: leave the weight alone.
            } else if cf <= c3 {
                self.remove_angles_guarded(id, 1);
            } else {
                self.remove_angles_guarded(id, 3);
            }
        }
    }

    fn add_angles(&self, id: ServerId, n: u32) {
        if let Err(e) = self.ring.add_angle(id, n) {
            warn!(server_id = id, error = %e, "could not add angles");
        }
    }

    fn remove_angles_guarded(&self, id: ServerId, n: u32) {
        if self.ring.servers_with_angles() == 1 && self.ring.server_angle_count(id) > 0 {
            debug!(server_id = id, "skipping removal for the last angled server");
            return;
        }
        self.ring.remove_angle(id, n);
    }

    /// One redistribution tick.
    pub async fn tick(&self) {
        self.refresh_server_table().await;
        self.reconcile_ring();
        self.remap_cache_keys();
        self.ring.record_snapshot(epoch_secs());
    }

    /// The redistribution loop.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            "redistribution loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("redistribution loop shutting down");
                    break;
                }
            }
        }
    }
}
