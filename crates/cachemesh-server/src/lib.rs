//! cachemesh-server — the backend cache worker.
//!
//! Each worker runs its own listener on a manager-assigned port,
//! serves opaque resources by name, and reports its load as a
//! *capacity factor* over the `/capacity-factor` telemetry endpoint.

pub mod request_monitor;
pub mod worker;

pub use request_monitor::RequestMonitor;
pub use worker::run_backend;
