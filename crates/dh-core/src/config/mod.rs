//! Configuration types and loading

pub mod serde_utils;

mod tuning;

pub use tuning::{MonitorConfig, PoolConfig, ReconnectConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::types::NodeIdentity;

/// Construction-time configuration for a whole fleet.
///
/// Tuning sections apply to every host; per-host identity comes from the
/// `nodes` table. Semantic validation (credential resolution, host
/// reachability) belongs to the layers that consume those values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Link pool tuning
    pub pool: PoolConfig,

    /// Recovery and heartbeat tuning
    pub reconnect: ReconnectConfig,

    /// Event monitor tuning
    pub monitor: MonitorConfig,

    /// Hosts to manage
    pub nodes: Vec<NodeIdentity>,
}

impl FleetConfig {
    /// Load and shape-check a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("{}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural sanity checks on the tuning sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConfigError::Invalid(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay exceeds reconnect.max_delay".to_string(),
            ));
        }
        Ok(())
    }
}
