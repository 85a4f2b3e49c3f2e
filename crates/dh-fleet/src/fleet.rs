//! Fleet-wide registry of node connections
//!
//! Owns the shared connection pool and event bus, and one
//! `NodeConnection` per registered host. Each host still runs its own
//! loops; nothing here spans hosts except the registry itself.

use std::sync::Arc;

use dashmap::DashMap;

use dh_core::config::FleetConfig;
use dh_core::events::StructuredEvent;
use dh_core::traits::TransportFactory;
use dh_core::types::{NodeId, NodeIdentity, NodeStatus};

use crate::bus::{EventBus, SubscriptionHandle};
use crate::connection::node::NodeConnection;
use crate::connection::pool::ConnectionPool;

/// All managed hosts behind one transport factory
pub struct Fleet {
    config: FleetConfig,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    nodes: DashMap<NodeId, NodeConnection>,
}

impl Fleet {
    /// Create an empty fleet backed by the given transport factory
    pub fn new(config: FleetConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(factory)),
            bus: Arc::new(EventBus::new()),
            nodes: DashMap::new(),
            config,
        }
    }

    /// Register every host declared in the configuration
    pub fn register_configured(&self) -> Vec<NodeConnection> {
        self.config
            .nodes
            .clone()
            .into_iter()
            .map(|identity| self.register(identity))
            .collect()
    }

    /// Register one host. Registering an already-known id returns the
    /// existing connection untouched.
    pub fn register(&self, identity: NodeIdentity) -> NodeConnection {
        if let Some(existing) = self.nodes.get(&identity.id) {
            tracing::warn!(node = %identity.id, "node already registered");
            return existing.value().clone();
        }
        self.pool
            .register(identity.clone(), self.config.pool.clone());
        let connection = NodeConnection::new(
            identity.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.bus),
            self.config.monitor.clone(),
            self.config.reconnect.clone(),
        );
        self.nodes.insert(identity.id, connection.clone());
        connection
    }

    /// Look up a registered host
    pub fn get(&self, id: &NodeId) -> Option<NodeConnection> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    /// Subscribe to the lifecycle event stream of every host
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&StructuredEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    /// Drop a subscription
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    /// Observability snapshot for every registered host
    pub fn status(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|entry| entry.status()).collect()
    }

    /// Tear down one host and forget it
    pub async fn dispose_node(&self, id: &NodeId) -> bool {
        let Some((_, connection)) = self.nodes.remove(id) else {
            return false;
        };
        connection.dispose().await;
        true
    }

    /// Tear down every host
    pub async fn dispose_all(&self) {
        let ids: Vec<NodeId> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.dispose_node(&id).await;
        }
    }
}
