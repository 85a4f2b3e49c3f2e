//! Tuning knobs for pooling, reconnection, and monitoring
//!
//! Each host's pool and reconnect manager receives its own immutable
//! snapshot of these values at construction time; nothing here is shared
//! mutable state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_ms;

/// Link pool tuning for one host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on links (leased plus idle) per host
    pub max_connections: usize,

    /// Idle floor maintained while the host is connected
    pub min_connections: usize,

    /// How long an acquire waits for a release before failing
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,

    /// Idle age beyond which a link is eligible for eviction
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Cadence of the idle-link probe and eviction pass
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            connection_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// Long-horizon recovery tuning for one host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum reconnect attempts before parking the node; 0 retries forever
    pub max_attempts: u32,

    /// Delay before the first scheduled attempt
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Cap on the doubled delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Liveness probe cadence while connected
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Jitter factor applied to each delay (0.0 disables)
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

/// Event monitor tuning for one host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Event-tail polling cadence
    #[serde(with = "duration_ms")]
    pub event_poll_interval: Duration,

    /// Reconciliation (full listing) cadence
    #[serde(with = "duration_ms")]
    pub reconcile_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_poll_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}
