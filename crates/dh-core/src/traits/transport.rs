//! Remote-execution transport traits
//!
//! The concrete transport (SSH or otherwise) lives outside this workspace;
//! the fleet crate only ever sees these seams.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::TransportError;
use crate::types::NodeIdentity;

/// One exec-capable session bound to a host.
///
/// A link carries at most one in-flight command; the pool hands out
/// exclusive leases so callers never have to coordinate.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Execute one command and return its textual output
    async fn execute(&self, command: &str) -> Result<String, TransportError>;

    /// Close the underlying session. Best-effort; implementations log
    /// failures rather than surface them.
    async fn close(&self);
}

/// Opens fresh exec sessions on demand
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a new exec-capable session to the given node
    async fn open(&self, node: &NodeIdentity)
        -> Result<Arc<dyn CommandTransport>, TransportError>;
}
