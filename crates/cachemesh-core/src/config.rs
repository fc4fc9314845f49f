//! Startup configuration.
//!
//! All tunables are consumed once at startup. A config can be loaded
//! from a TOML file and selectively overridden by CLI flags; every field
//! has a default so a bare `Config::default()` runs a sensible cluster.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which hash function maps resource names to ring positions.
///
/// Part of the protocol contract: changing it remaps every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunctionId {
    /// 32-bit FNV-1a over the resource name's UTF-8 bytes.
    #[default]
    Fnv1a32,
    /// The last four bytes of the MD5 digest, big-endian.
    Md5Low32,
}

/// Errors detected while validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("server_load_cutoffs must be strictly increasing, got {0:?}")]
    CutoffOrdering([f64; 4]),

    #[error("selectable port range [{0}, {1}) is empty")]
    EmptyPortRange(u16, u16),

    #[error("ring_size {0} must be a power of two >= 16384")]
    RingSize(u32),

    #[error("growth_rate must be positive, got {0}")]
    GrowthRate(f64),

    #[error("target_cf must be positive, got {0}")]
    TargetCf(f64),

    #[error("initial_angles_per_server must be >= 1")]
    InitialAngles,
}

/// Cluster-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mean capacity factor the autoscaler drives toward.
    pub target_cf: f64,
    /// Gain applied to the (average - target) difference per modulation
    /// tick; the rounded product is the number of workers started or
    /// stopped.
    pub growth_rate: f64,
    /// Load bands `[c0, c1, c2, c3]` driving angle reweighting; must be
    /// strictly increasing.
    pub server_load_cutoffs: [f64; 4],
    /// How long a backend keeps per-request records when computing its
    /// capacity factor.
    pub request_record_ttl_ms: u64,
    /// Cadence of the autoscaler's modulation loop.
    pub modulation_interval_ms: u64,
    /// Cadence of the balancer's ring-reweighting loop.
    pub redistribution_interval_ms: u64,
    /// Cadence of the telemetry poller.
    pub poll_interval_ms: u64,
    /// Workers started before the balancer begins serving.
    pub initial_backend_count: u32,
    /// First port handed to a worker (inclusive).
    pub port_range_start: u16,
    /// End of the selectable port range (exclusive).
    pub port_range_end: u16,
    /// Number of positions on the hash ring; a power of two >= 2^14.
    pub ring_size: u32,
    /// Angles placed for a server when it first joins the ring.
    pub initial_angles_per_server: u32,
    /// Hash function mapping resource names to ring positions.
    pub hash_function: HashFunctionId,
    /// Seed for the ring's angle-position draws; same seed, same ring.
    pub angle_seed: u64,
    /// Client-facing balancer port.
    pub dispatcher_port: u16,
    /// Deadline for each outbound telemetry request.
    pub telemetry_timeout_ms: u64,
    /// How long the manager waits for a new worker's listener to bind.
    pub backend_ready_timeout_ms: u64,
    /// Grace period before a stopping worker is force-aborted.
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_cf: 0.5,
            growth_rate: 5.0,
            server_load_cutoffs: [0.25, 0.5, 0.75, 1.5],
            request_record_ttl_ms: 10_000,
            modulation_interval_ms: 2_000,
            redistribution_interval_ms: 1_000,
            poll_interval_ms: 500,
            initial_backend_count: 39,
            port_range_start: 37_100,
            port_range_end: 37_200,
            ring_size: 1 << 16,
            initial_angles_per_server: 10,
            hash_function: HashFunctionId::Fnv1a32,
            angle_seed: 42,
            dispatcher_port: 8080,
            telemetry_timeout_ms: 2_000,
            backend_ready_timeout_ms: 5_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl Config {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the control loops rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.server_load_cutoffs;
        if !(c[0] < c[1] && c[1] < c[2] && c[2] < c[3]) {
            return Err(ConfigError::CutoffOrdering(*c));
        }
        if self.port_range_start >= self.port_range_end {
            return Err(ConfigError::EmptyPortRange(
                self.port_range_start,
                self.port_range_end,
            ));
        }
        if !self.ring_size.is_power_of_two() || self.ring_size < (1 << 14) {
            return Err(ConfigError::RingSize(self.ring_size));
        }
        if self.growth_rate <= 0.0 {
            return Err(ConfigError::GrowthRate(self.growth_rate));
        }
        if self.target_cf <= 0.0 {
            return Err(ConfigError::TargetCf(self.target_cf));
        }
        if self.initial_angles_per_server == 0 {
            return Err(ConfigError::InitialAngles);
        }
        Ok(())
    }

    pub fn modulation_interval(&self) -> Duration {
        Duration::from_millis(self.modulation_interval_ms)
    }

    pub fn redistribution_interval(&self) -> Duration {
        Duration::from_millis(self.redistribution_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    pub fn backend_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_ready_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_unordered_cutoffs() {
        let mut config = Config::default();
        config.server_load_cutoffs = [0.5, 0.25, 0.75, 1.5];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CutoffOrdering(_))
        ));
    }

    #[test]
    fn rejects_equal_cutoffs() {
        let mut config = Config::default();
        config.server_load_cutoffs = [0.25, 0.5, 0.5, 1.5];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CutoffOrdering(_))
        ));
    }

    #[test]
    fn rejects_empty_port_range() {
        let mut config = Config::default();
        config.port_range_start = 37_200;
        config.port_range_end = 37_200;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyPortRange(_, _))
        ));
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let mut config = Config::default();
        config.ring_size = 50_000;
        assert!(matches!(config.validate(), Err(ConfigError::RingSize(_))));
    }

    #[test]
    fn rejects_undersized_ring() {
        let mut config = Config::default();
        config.ring_size = 1 << 10;
        assert!(matches!(config.validate(), Err(ConfigError::RingSize(_))));
    }

    #[test]
    fn rejects_non_positive_growth_rate() {
        let mut config = Config::default();
        config.growth_rate = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::GrowthRate(_))));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
target_cf = 0.6
initial_backend_count = 5
hash_function = "md5_low32"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.target_cf, 0.6);
        assert_eq!(config.initial_backend_count, 5);
        assert_eq!(config.hash_function, HashFunctionId::Md5Low32);
        // Untouched fields keep their defaults.
        assert_eq!(config.growth_rate, 5.0);
        assert_eq!(config.ring_size, 1 << 16);
    }
}
