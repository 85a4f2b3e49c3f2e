//! dh-fleet: connection lifecycle, pooling, and container event monitoring
//!
//! This crate keeps live control channels to a fleet of hosts that run a
//! container runtime reachable only through a single-command
//! remote-execution transport. Per host it manages a bounded pool of
//! reusable exec links, a two-tier reconnect policy with a connected-state
//! heartbeat, and a dual-mode event monitor that turns lossy polling into
//! a deduplicated stream of structured lifecycle events, fanned out
//! through an in-process bus.

pub mod bus;
pub mod connection;
pub mod fleet;

mod monitor;

pub use bus::{EventBus, SubscriptionHandle};
pub use connection::node::NodeConnection;
pub use connection::pool::{ConnectionPool, LinkLease};
pub use connection::reconnect::{ExponentialBackoff, RetryState};
pub use fleet::Fleet;
