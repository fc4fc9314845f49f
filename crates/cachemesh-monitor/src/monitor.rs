//! The server monitor.
//!
//! Structural changes to the table (add, deactivate) come only from
//! the manager; the poll loop writes only per-server telemetry fields.
//! Everything handed out is a deep copy, and the current capacity
//! factor is always published together with its record entry under one
//! write-lock section, so readers never see the pair out of sync.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use cachemesh_core::{epoch_secs, ServerId};

use crate::info::{MonitorError, ServerInfo};
use crate::probe::fetch_capacity_factor;

/// Tracks every cache server worker and its load over time.
pub struct ServerMonitor {
    servers: RwLock<HashMap<ServerId, ServerInfo>>,
    /// Active-worker count per second, first write wins.
    server_count: Mutex<BTreeMap<u64, usize>>,
    telemetry_timeout: Duration,
}

impl ServerMonitor {
    pub fn new(telemetry_timeout: Duration) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            server_count: Mutex::new(BTreeMap::new()),
            telemetry_timeout,
        }
    }

    /// Track a newly started worker.
    pub fn add_server(&self, id: ServerId, port: u16, now: u64) -> Result<(), MonitorError> {
        let mut servers = self.servers.write().expect("server table lock");
        if servers.contains_key(&id) {
            return Err(MonitorError::DuplicateId(id));
        }
        servers.insert(id, ServerInfo::new(id, port, now));
        Ok(())
    }

    /// Mark a worker retired. Idempotent once inactive; the first
    /// deactivation timestamp is kept.
    pub fn deactivate_server(&self, id: ServerId, now: u64) -> Result<(), MonitorError> {
        let mut servers = self.servers.write().expect("server table lock");
        let info = servers.get_mut(&id).ok_or(MonitorError::UnknownServer(id))?;
        if info.active {
            info.active = false;
            info.deactivation_time = Some(now);
        }
        Ok(())
    }

    /// Publish one telemetry sample: the current value and its record
    /// entry land under the same lock section.
    pub fn record_sample(
        &self,
        id: ServerId,
        timestamp: u64,
        capacity_factor: f64,
    ) -> Result<(), MonitorError> {
        let mut servers = self.servers.write().expect("server table lock");
        let info = servers.get_mut(&id).ok_or(MonitorError::UnknownServer(id))?;
        info.current_capacity_factor = Some(capacity_factor);
        info.capacity_factor_record
            .insert(timestamp, capacity_factor);
        Ok(())
    }

    /// Record the active-worker count for a given second. The first
    /// write for a second wins.
    pub fn update_server_count(&self, second: u64, count: usize) {
        let mut record = self.server_count.lock().expect("server count lock");
        record.entry(second).or_insert(count);
    }

    /// Copy of the per-second active-worker record.
    pub fn server_count_record(&self) -> BTreeMap<u64, usize> {
        self.server_count.lock().expect("server count lock").clone()
    }

    /// Mean of the current capacity factor over active workers with a
    /// strictly positive sample; 0 when none qualify.
    pub fn average_capacity_factor(&self) -> f64 {
        let servers = self.servers.read().expect("server table lock");
        let mut sum = 0.0;
        let mut count = 0usize;
        for info in servers.values() {
            if info.active {
                if let Some(cf) = info.current_capacity_factor {
                    if cf > 0.0 {
                        sum += cf;
                        count += 1;
                    }
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Number of active workers.
    pub fn active_count(&self) -> usize {
        let servers = self.servers.read().expect("server table lock");
        servers.values().filter(|info| info.active).count()
    }

    /// Deep copy of the whole server table.
    pub fn snapshot(&self) -> HashMap<ServerId, ServerInfo> {
        self.servers.read().expect("server table lock").clone()
    }

    /// `(id, port)` of every active worker.
    pub fn active_servers(&self) -> Vec<(ServerId, u16)> {
        let servers = self.servers.read().expect("server table lock");
        servers
            .values()
            .filter(|info| info.active)
            .map(|info| (info.id, info.port))
            .collect()
    }

    /// Poll every active worker once, in parallel.
    ///
    /// Each poll is independent: a failure is dropped for this tick and
    /// leaves the stored capacity factor untouched.
    pub async fn ping_all(&self) {
        let targets = self.active_servers();
        let mut handles = Vec::with_capacity(targets.len());

        for (id, port) in targets {
            let deadline = self.telemetry_timeout;
            handles.push(tokio::spawn(async move {
                (id, port, fetch_capacity_factor(port, deadline).await)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((id, _, Ok(cf))) => {
                    // The worker may have been retired mid-poll.
                    if let Err(e) = self.record_sample(id, epoch_secs(), cf) {
                        debug!(server_id = id, error = %e, "dropping late telemetry sample");
                    }
                }
                Ok((id, port, Err(e))) => {
                    debug!(server_id = id, port, error = %e, "telemetry poll failed");
                }
                Err(e) => {
                    debug!(error = %e, "telemetry poll task failed");
                }
            }
        }
    }

    /// The poll loop: ping all workers and record the active count
    /// every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "server monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.ping_all().await;
                    self.update_server_count(epoch_secs(), self.active_count());
                }
                _ = shutdown.changed() => {
                    info!("server monitor shutting down");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for ServerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMonitor")
            .field("active", &self.active_count())
            .finish()
    }
}
