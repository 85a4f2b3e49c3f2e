//! Connection lifecycle management

pub mod node;
pub mod pool;
pub mod reconnect;

pub use node::NodeConnection;
pub use pool::{ConnectionPool, LinkId, LinkLease};
pub use reconnect::{ExponentialBackoff, RetryState};
