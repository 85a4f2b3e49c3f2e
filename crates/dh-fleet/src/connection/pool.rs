//! Per-host pools of reusable remote-execution links
//!
//! The pool is the sole owner of link existence and accounting. Callers
//! get `LinkLease` guards: a lease is exclusive, runs one command at a
//! time, and releasing it is a move, so double-release and
//! use-after-release do not compile.
//!
//! Capacity is enforced with one semaphore per host sized at the
//! configured maximum: holding a permit *is* holding lease capacity, so
//! the number of concurrently leased links can never exceed the cap and a
//! blocked `acquire` wakes as soon as any lease drops.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dh_core::config::PoolConfig;
use dh_core::error::{ConnectionError, TransportError};
use dh_core::traits::{CommandTransport, TransportFactory};
use dh_core::types::{NodeId, NodeIdentity, PoolStats};

/// Probe for idle links. Exercises the transport session itself, not the
/// container runtime behind it.
const IDLE_PROBE_COMMAND: &str = "true";

/// Identifier for one pooled link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(Uuid);

impl LinkId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One reusable exec session, owned by the pool
struct PooledLink {
    id: LinkId,
    transport: Arc<dyn CommandTransport>,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    commands: u64,
}

#[derive(Default)]
struct HostState {
    links: Vec<PooledLink>,
}

struct HostPool {
    node: NodeIdentity,
    config: PoolConfig,
    /// One permit per allowed concurrent lease
    leases: Arc<Semaphore>,
    state: Mutex<HostState>,
    /// Stops this host's maintenance loop
    cancel: CancellationToken,
}

impl HostPool {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the least-recently-used idle link, marking it leased
    fn take_idle_lru(&self) -> Option<(LinkId, Arc<dyn CommandTransport>)> {
        let mut state = self.lock();
        let idx = state
            .links
            .iter()
            .enumerate()
            .filter(|(_, link)| !link.in_use)
            .min_by_key(|(_, link)| link.last_used)
            .map(|(idx, _)| idx)?;
        let link = &mut state.links[idx];
        link.in_use = true;
        Some((link.id, Arc::clone(&link.transport)))
    }

    /// Record a freshly opened link
    fn install(&self, transport: Arc<dyn CommandTransport>, in_use: bool) -> LinkId {
        let id = LinkId::new();
        let now = Instant::now();
        self.lock().links.push(PooledLink {
            id,
            transport,
            created_at: now,
            last_used: now,
            in_use,
            commands: 0,
        });
        id
    }

    /// Return a leased link to the idle set
    fn release(&self, id: LinkId) {
        let mut state = self.lock();
        if let Some(link) = state.links.iter_mut().find(|link| link.id == id) {
            link.in_use = false;
            link.last_used = Instant::now();
        }
    }

    /// Forget a link entirely, handing its transport back for closing
    fn remove(&self, id: LinkId) -> Option<Arc<dyn CommandTransport>> {
        let mut state = self.lock();
        let idx = state.links.iter().position(|link| link.id == id)?;
        let link = state.links.remove(idx);
        tracing::debug!(
            node = %self.node.id,
            link = %link.id,
            commands = link.commands,
            "link removed from pool"
        );
        Some(link.transport)
    }

    fn note_command(&self, id: LinkId) {
        let mut state = self.lock();
        if let Some(link) = state.links.iter_mut().find(|link| link.id == id) {
            link.commands += 1;
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        let active = state.links.iter().filter(|link| link.in_use).count();
        PoolStats {
            total: state.links.len(),
            active,
            idle: state.links.len() - active,
        }
    }
}

/// Exclusive lease on one pooled link.
///
/// Dropping the lease returns the link to the idle set and updates its
/// last-used time; `discard` removes a link that proved unhealthy instead
/// of recycling it. Both consume the lease.
pub struct LinkLease {
    host: Arc<HostPool>,
    id: LinkId,
    transport: Arc<dyn CommandTransport>,
    /// Held for the lease lifetime; dropping it wakes one waiting acquire
    _permit: OwnedSemaphorePermit,
    discarded: bool,
}

impl LinkLease {
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Execute one command on the leased link
    pub async fn execute(&mut self, command: &str) -> Result<String, TransportError> {
        self.host.note_command(self.id);
        self.transport.execute(command).await
    }

    /// Close and forget a link that failed; it never returns to the idle set
    pub async fn discard(mut self) {
        self.discarded = true;
        if let Some(transport) = self.host.remove(self.id) {
            transport.close().await;
        }
    }
}

impl std::fmt::Debug for LinkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkLease")
            .field("id", &self.id)
            .field("discarded", &self.discarded)
            .finish_non_exhaustive()
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        if !self.discarded {
            self.host.release(self.id);
        }
    }
}

/// Bounded pools of exec links, one per registered host
pub struct ConnectionPool {
    factory: Arc<dyn TransportFactory>,
    hosts: DashMap<NodeId, Arc<HostPool>>,
}

impl ConnectionPool {
    /// Create an empty pool backed by the given transport factory
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            hosts: DashMap::new(),
        }
    }

    /// Register a host and start its maintenance loop. Registering an
    /// already-known host is a no-op.
    pub fn register(&self, node: NodeIdentity, config: PoolConfig) {
        if self.hosts.contains_key(&node.id) {
            tracing::warn!(node = %node.id, "host already registered with the pool");
            return;
        }
        let node_id = node.id.clone();
        let host = Arc::new(HostPool {
            leases: Arc::new(Semaphore::new(config.max_connections)),
            state: Mutex::new(HostState::default()),
            cancel: CancellationToken::new(),
            node,
            config,
        });
        self.hosts.insert(node_id, Arc::clone(&host));
        tokio::spawn(maintain(host, Arc::clone(&self.factory)));
    }

    /// Lease a link for the given host.
    ///
    /// Reuses the least-recently-used idle link, opens a new one below the
    /// cap, and otherwise waits up to the configured connection timeout for
    /// a release before failing with `PoolExhausted`.
    pub async fn acquire(&self, node_id: &NodeId) -> Result<LinkLease, ConnectionError> {
        let host = self
            .hosts
            .get(node_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| ConnectionError::UnknownNode(node_id.clone()))?;

        let permit = tokio::time::timeout(
            host.config.connection_timeout,
            Arc::clone(&host.leases).acquire_owned(),
        )
        .await
        .map_err(|_| ConnectionError::PoolExhausted(node_id.clone()))?
        .map_err(|_| ConnectionError::PoolExhausted(node_id.clone()))?;

        if let Some((id, transport)) = host.take_idle_lru() {
            return Ok(LinkLease {
                host,
                id,
                transport,
                _permit: permit,
                discarded: false,
            });
        }

        // No idle link; the permit guarantees we are below the cap
        let transport = self.factory.open(&host.node).await?;
        let id = host.install(Arc::clone(&transport), true);
        tracing::debug!(node = %host.node.id, link = %id, "opened new pooled link");
        Ok(LinkLease {
            host,
            id,
            transport,
            _permit: permit,
            discarded: false,
        })
    }

    /// Link accounting for one host
    pub fn stats(&self, node_id: &NodeId) -> Option<PoolStats> {
        self.hosts.get(node_id).map(|host| host.stats())
    }

    /// Whether the host has been registered
    pub fn is_registered(&self, node_id: &NodeId) -> bool {
        self.hosts.contains_key(node_id)
    }

    /// Tear down a host: stop its maintenance loop and close every link
    /// immediately, leased or not.
    pub async fn dispose(&self, node_id: &NodeId) {
        let Some((_, host)) = self.hosts.remove(node_id) else {
            return;
        };
        host.cancel.cancel();
        let links = std::mem::take(&mut host.lock().links);
        let count = links.len();
        for link in links {
            link.transport.close().await;
        }
        tracing::info!(node = %node_id, links = count, "host pool disposed");
    }
}

/// Background upkeep for one host: probe idle links, evict stale ones, and
/// keep the idle floor topped up.
async fn maintain(host: Arc<HostPool>, factory: Arc<dyn TransportFactory>) {
    let period = host.config.health_check_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = host.cancel.cancelled() => break,
            _ = ticker.tick() => {
                probe_idle_links(&host).await;
                evict_stale_links(&host).await;
                replenish(&host, &factory).await;
            }
        }
    }
}

/// Probe each idle link with a no-op command, closing the ones that fail.
///
/// Every probe runs under a lease permit, so client acquires stay within
/// the configured cap even while the prober is busy.
async fn probe_idle_links(host: &Arc<HostPool>) {
    let idle: Vec<LinkId> = host
        .lock()
        .links
        .iter()
        .filter(|link| !link.in_use)
        .map(|link| link.id)
        .collect();

    for id in idle {
        let Ok(_permit) = Arc::clone(&host.leases).try_acquire_owned() else {
            // every permit is leased out, nothing is idle anymore
            break;
        };
        let transport = {
            let mut state = host.lock();
            match state
                .links
                .iter_mut()
                .find(|link| link.id == id && !link.in_use)
            {
                Some(link) => {
                    link.in_use = true;
                    Arc::clone(&link.transport)
                }
                // leased or evicted since the snapshot
                None => continue,
            }
        };

        match transport.execute(IDLE_PROBE_COMMAND).await {
            Ok(_) => {
                // healthy: back to idle without refreshing last_used, so
                // probing never shields a link from idle eviction
                let mut state = host.lock();
                if let Some(link) = state.links.iter_mut().find(|link| link.id == id) {
                    link.in_use = false;
                }
            }
            Err(err) => {
                tracing::warn!(
                    node = %host.node.id,
                    link = %id,
                    error = %err,
                    "idle link failed health probe, closing"
                );
                if let Some(transport) = host.remove(id) {
                    transport.close().await;
                }
            }
        }
    }
}

/// Close idle links older than the idle timeout, oldest first, without
/// dropping the host below its configured minimum.
async fn evict_stale_links(host: &Arc<HostPool>) {
    let min = host.config.min_connections;
    let cutoff = host.config.idle_timeout;
    let mut victims = Vec::new();
    {
        let mut state = host.lock();
        while state.links.len() > min {
            let stale = state
                .links
                .iter()
                .enumerate()
                .filter(|(_, link)| !link.in_use && link.last_used.elapsed() >= cutoff)
                .min_by_key(|(_, link)| link.last_used)
                .map(|(idx, _)| idx);
            let Some(idx) = stale else { break };
            let link = state.links.remove(idx);
            tracing::debug!(
                node = %host.node.id,
                link = %link.id,
                age_secs = link.created_at.elapsed().as_secs(),
                commands = link.commands,
                "evicting stale idle link"
            );
            victims.push(link.transport);
        }
    }
    for transport in victims {
        transport.close().await;
    }
}

/// Open replacement links until the host is back at its idle floor
async fn replenish(host: &Arc<HostPool>, factory: &Arc<dyn TransportFactory>) {
    loop {
        let deficit = {
            let state = host.lock();
            host.config.min_connections.saturating_sub(state.links.len())
        };
        if deficit == 0 {
            return;
        }
        match factory.open(&host.node).await {
            Ok(transport) => {
                let installed = {
                    let state = host.lock();
                    state.links.len() < host.config.min_connections
                };
                if installed {
                    host.install(transport, false);
                } else {
                    // a concurrent acquire filled the gap first
                    transport.close().await;
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(node = %host.node.id, error = %err, "replenish failed, will retry next pass");
                return;
            }
        }
    }
}
