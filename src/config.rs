//! Configuration Module
//!
//! Handles loading cluster and server configuration from environment variables.

use std::env;
use std::time::Duration;

/// Cluster configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of nodes started by the in-process cluster
    pub cluster_size: usize,
    /// Per-node capacity before LRU eviction kicks in (0 = unbounded)
    pub max_entries: usize,
    /// Bound on waiting for a member to acknowledge a replication request
    pub replication_timeout_ms: u64,
    /// Interval between expiry sweeps on each node
    pub sweep_interval_ms: u64,
    /// HTTP server port
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CLUSTER_SIZE` - Nodes in the cluster (default: 3)
    /// - `MAX_ENTRIES` - Per-node capacity, 0 disables eviction (default: 0)
    /// - `REPLICATION_TIMEOUT_MS` - Acknowledgement bound (default: 5000)
    /// - `SWEEP_INTERVAL_MS` - Expiry sweep frequency (default: 1000)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cluster_size: parse_var("CLUSTER_SIZE").unwrap_or(defaults.cluster_size),
            max_entries: parse_var("MAX_ENTRIES").unwrap_or(defaults.max_entries),
            replication_timeout_ms: parse_var("REPLICATION_TIMEOUT_MS")
                .unwrap_or(defaults.replication_timeout_ms),
            sweep_interval_ms: parse_var("SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.sweep_interval_ms),
            server_port: parse_var("SERVER_PORT").unwrap_or(defaults.server_port),
        }
    }

    /// Replication acknowledgement bound as a Duration.
    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    /// Expiry sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_size: 3,
            max_entries: 0,
            replication_timeout_ms: 5000,
            sweep_interval_ms: 1000,
            server_port: 3000,
        }
    }
}
