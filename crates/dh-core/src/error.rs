//! Error types for the Dockhand fleet core

use crate::types::NodeId;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the Dockhand ecosystem
#[derive(Error, Debug)]
pub enum DhError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the remote-execution transport.
///
/// Transient by definition; the owning loop or retry policy decides
/// whether and when to try again.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Remote command did not complete in time
    #[error("Command timed out")]
    Timeout,

    /// The exec session is gone
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Command was delivered but failed remotely
    #[error("Remote command failed: {0}")]
    CommandFailed(String),

    /// I/O error on the underlying channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Operation requires a connected node; no queuing, no implicit wait
    #[error("Node is not connected")]
    NotConnected,

    /// Every link is busy and none was released within the connection timeout
    #[error("Connection pool exhausted for node {0}")]
    PoolExhausted(NodeId),

    /// Reconnect budget spent; the node stays parked until an explicit trigger
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// Node was never registered with the pool
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Control-plane verification failed on a fresh link
    #[error("Control-plane probe failed: {0}")]
    ProbeFailed(String),

    /// Transport failure during a connection operation
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Unparseable command output. The affected row is skipped; the batch
/// that carried it continues.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Event record with too few fields
    #[error("Malformed event record: {0:?}")]
    MalformedEvent(String),

    /// Listing row that does not match the expected field order
    #[error("Malformed listing row: {0:?}")]
    MalformedRow(String),

    /// Timestamp field that does not parse
    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
