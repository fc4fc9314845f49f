//! cachemesh-monitor — backend telemetry collection.
//!
//! Owns the table of known cache server workers, polls each active one
//! for its capacity factor on a fixed cadence, and exposes the
//! aggregates the autoscaler and balancer consume.

pub mod info;
pub mod monitor;
pub mod probe;

pub use info::{MonitorError, ServerInfo};
pub use monitor::ServerMonitor;
pub use probe::{fetch_capacity_factor, TelemetryError};
