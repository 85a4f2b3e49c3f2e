//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a managed host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a new node ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn default_port() -> u16 {
    22
}

/// Identity of a managed host. Immutable after construction; the
/// credential field is an opaque reference resolved by an external
/// secret layer, never the secret itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique host identifier
    pub id: NodeId,

    /// Human-readable display name
    pub name: String,

    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,

    /// Host address to connect to
    pub host: String,

    /// Port of the remote-execution endpoint
    #[serde(default = "default_port")]
    pub port: u16,

    /// Opaque credential reference
    #[serde(default)]
    pub credential: Option<String>,
}

impl NodeIdentity {
    /// `host:port` form used by transport implementations
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the host has a specific tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Connection state of a node.
///
/// Transitions only along defined edges: `Disconnected -> Connecting ->
/// {Connected, Error}`, `Connected -> Disconnected` (explicit disconnect)
/// or `Connected -> Error` (probe failure), `Error -> Connecting`
/// (reconnect attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection; the initial state
    Disconnected,
    /// A connect or reconnect attempt is in flight
    Connecting,
    /// Control plane verified, monitoring active
    Connected,
    /// Connectivity lost or attempts exhausted
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Last observed state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Paused,
    Restarting,
    Created,
    /// Anything the listing output reports that we do not recognize
    Unknown,
}

impl ContainerState {
    /// Parse a state label as printed by the runtime's listing output.
    /// Unrecognized labels degrade to `Unknown` rather than failing.
    pub fn parse_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "running" | "up" => ContainerState::Running,
            "exited" | "stopped" | "dead" => ContainerState::Stopped,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "created" => ContainerState::Created,
            _ => ContainerState::Unknown,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Created => write!(f, "created"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// One row of a container listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub image: String,
}

/// Link accounting for one host's pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Links currently owned by the pool for this host
    pub total: usize,
    /// Links currently leased out
    pub active: usize,
    /// Links available for lease
    pub idle: usize,
}

/// Snapshot of a node's connection health for the observability surface
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: NodeId,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub pool: PoolStats,
}
