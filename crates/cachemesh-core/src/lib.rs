//! cachemesh-core — shared types and configuration.
//!
//! Everything the other cachemesh crates agree on lives here: the server
//! id space, the wire types exchanged between the manager's control API
//! and the balancer, and the [`Config`] consumed at startup.

pub mod config;
pub mod types;

pub use config::{Config, ConfigError, HashFunctionId};
pub use types::{ServerEntry, ServerId, StartedServer};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
