//! Per-server bookkeeping.

use std::collections::BTreeMap;

use thiserror::Error;

use cachemesh_core::ServerId;

/// Monitor invariant violations. These indicate a caller bug, not a
/// runtime condition; they map to 500 if they ever leak through HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("server {0} is already tracked")]
    DuplicateId(ServerId),

    #[error("server {0} is not tracked")]
    UnknownServer(ServerId),
}

/// Everything the monitor knows about one worker.
///
/// Created when the manager starts the worker, never deleted — retired
/// workers stay around (inactive) for reporting.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: ServerId,
    pub port: u16,
    /// Seconds since the epoch when the worker started.
    pub start_time: u64,
    /// Set once, when the manager retires the worker.
    pub deactivation_time: Option<u64>,
    pub active: bool,
    /// Timestamped capacity-factor samples, seconds -> value.
    pub capacity_factor_record: BTreeMap<u64, f64>,
    /// Most recent sample; `None` until the first successful poll,
    /// which is distinct from a sampled 0.0 on an idle worker.
    pub current_capacity_factor: Option<f64>,
}

impl ServerInfo {
    pub fn new(id: ServerId, port: u16, now: u64) -> Self {
        Self {
            id,
            port,
            start_time: now,
            deactivation_time: None,
            active: true,
            capacity_factor_record: BTreeMap::new(),
            current_capacity_factor: None,
        }
    }

    /// The most recent sample, or 0 if the worker was never polled.
    pub fn current_or_zero(&self) -> f64 {
        self.current_capacity_factor.unwrap_or(0.0)
    }
}
