//! Shared domain and wire types.

use serde::{Deserialize, Serialize};

/// Unique identifier for a cache server worker.
///
/// Assigned monotonically by the manager and never reused for the
/// lifetime of the process, even after the worker is retired.
pub type ServerId = u32;

/// One entry of the manager's `GET /cache-servers` response.
///
/// Keyed by the server id (as a decimal string) in the response object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub port: u16,
    /// Most recent capacity factor sample, or 0 if the server has never
    /// been polled.
    #[serde(rename = "capacityFactor")]
    pub capacity_factor: f64,
    pub active: bool,
}

/// Response body of the manager's `POST /cache-servers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedServer {
    pub id: ServerId,
    pub port: u16,
}
