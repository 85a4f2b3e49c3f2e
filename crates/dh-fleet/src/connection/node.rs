//! Per-host connection state machine
//!
//! A `NodeConnection` owns everything that runs on behalf of one host:
//! its state, the leases it takes for administrative commands, its event
//! monitor, and its reconnect manager. Recovery is two-tier: `connect`
//! performs a short bounded burst of immediate attempts, and once that
//! burst is spent control transfers exactly once to the reconnect
//! manager's backoff policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dh_core::config::{MonitorConfig, ReconnectConfig};
use dh_core::error::ConnectionError;
use dh_core::events::{epoch_millis, StructuredEvent};
use dh_core::output::parse_container_listing;
use dh_core::types::{ConnectionState, ContainerSummary, NodeIdentity, NodeStatus};

use super::pool::ConnectionPool;
use super::reconnect::{ReconnectManager, RetryState};
use crate::bus::EventBus;
use crate::monitor::EventMonitor;

/// Immediate attempts made by `connect` before handing off to the
/// reconnect manager
const CONNECT_BURST_ATTEMPTS: u32 = 3;

/// Fixed delay between burst attempts
const CONNECT_BURST_DELAY: Duration = Duration::from_secs(2);

/// Verifies that the control plane answers, at connect time and on every
/// heartbeat
pub(crate) const CONTROL_PLANE_PROBE: &str = "docker version --format '{{.Server.Version}}'";

/// Full container listing in the fixed field order `id|name|state|image`
pub(crate) const LIST_CONTAINERS: &str =
    "docker ps -a --format '{{.ID}}|{{.Names}}|{{.State}}|{{.Image}}'";

/// Live control channel to one host
#[derive(Clone)]
pub struct NodeConnection {
    inner: Arc<NodeInner>,
}

/// Shared core of a `NodeConnection`, also reachable from the scheduled
/// loops through weak references
pub(crate) struct NodeInner {
    identity: NodeIdentity,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    monitor_config: MonitorConfig,
    state: Mutex<ConnectionState>,
    last_error: Mutex<Option<String>>,
    /// Bumped on disposal; every scheduled tick compares its captured
    /// generation against this before acting
    epoch: Arc<AtomicU64>,
    /// Cancels the monitor and heartbeat of the current connected session
    session: Mutex<Option<CancellationToken>>,
    reconnect: ReconnectManager,
}

impl NodeConnection {
    /// Create a connection for a host already registered with the pool
    pub fn new(
        identity: NodeIdentity,
        pool: Arc<ConnectionPool>,
        bus: Arc<EventBus>,
        monitor_config: MonitorConfig,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                identity,
                pool,
                bus,
                monitor_config,
                state: Mutex::new(ConnectionState::Disconnected),
                last_error: Mutex::new(None),
                epoch: Arc::new(AtomicU64::new(0)),
                session: Mutex::new(None),
                reconnect: ReconnectManager::new(reconnect_config),
            }),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recovery bookkeeping of the reconnect manager
    pub fn retry_state(&self) -> RetryState {
        self.inner.reconnect.retry_state()
    }

    /// Observability snapshot: state, last error, pool accounting
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node: self.inner.identity.id.clone(),
            state: self.state(),
            last_error: self.last_error(),
            pool: self
                .inner
                .pool
                .stats(&self.inner.identity.id)
                .unwrap_or_default(),
        }
    }

    /// Connect to the host.
    ///
    /// A no-op while a connect attempt is already in flight, while the
    /// node is connected, and while the reconnect manager owns recovery.
    /// Performs a short bounded burst of attempts; when the burst is
    /// spent, the node moves to `Error` and recovery is handed to the
    /// reconnect manager.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        {
            let mut state = inner.state_lock();
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                ConnectionState::Error if inner.reconnect.is_recovering() => {
                    tracing::debug!(
                        node = %inner.identity.id,
                        "connect ignored, recovery owns reconnect attempts"
                    );
                    return Ok(());
                }
                _ => *state = ConnectionState::Connecting,
            }
        }

        let mut last: Option<ConnectionError> = None;
        for attempt in 1..=CONNECT_BURST_ATTEMPTS {
            match NodeInner::establish(inner).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        node = %inner.identity.id,
                        attempt,
                        error = %err,
                        "connect attempt failed"
                    );
                    last = Some(err);
                    if attempt < CONNECT_BURST_ATTEMPTS {
                        tokio::time::sleep(CONNECT_BURST_DELAY).await;
                    }
                }
            }
        }

        // burst spent: park in Error and hand recovery off, exactly once
        let reason = last
            .as_ref()
            .map(|err| err.to_string())
            .unwrap_or_else(|| "connect failed".to_string());
        inner.mark_error(&reason);
        inner.reconnect.begin_recovery(
            Arc::downgrade(inner),
            inner.current_epoch(),
            reason,
        );
        match last {
            Some(err) => Err(err),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Stop monitoring and drop to `Disconnected`. Pool links stay open
    /// for a later `connect`.
    pub async fn disconnect(&self) {
        self.inner.stop_session();
        self.inner.set_state(ConnectionState::Disconnected);
        tracing::info!(node = %self.inner.identity.id, "disconnected");
    }

    /// Explicit disconnect-then-connect cycle
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.disconnect().await;
        self.connect().await
    }

    /// Tear the node down. Halts the monitor, heartbeat, and any pending
    /// reconnect attempt before returning, then closes the host's links.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.reconnect.shutdown();
        inner.stop_session();
        inner.set_state(ConnectionState::Disconnected);
        inner.pool.dispose(&inner.identity.id).await;
        tracing::info!(node = %inner.identity.id, "node disposed");
    }

    // --- container operations -------------------------------------------
    //
    // Each leases one link, issues one command, and releases the link.
    // None of them retries: repeating these commands is not assumed
    // idempotent, so failures surface directly to the caller.

    pub async fn start_container(&self, container: &str) -> Result<String, ConnectionError> {
        self.inner.command(&format!("docker start {container}")).await
    }

    pub async fn stop_container(&self, container: &str) -> Result<String, ConnectionError> {
        self.inner.command(&format!("docker stop {container}")).await
    }

    pub async fn restart_container(&self, container: &str) -> Result<String, ConnectionError> {
        self.inner
            .command(&format!("docker restart {container}"))
            .await
    }

    /// Run a command inside a container and return its output
    pub async fn exec(&self, container: &str, command: &str) -> Result<String, ConnectionError> {
        self.inner
            .command(&format!("docker exec {container} {command}"))
            .await
    }

    /// Fetch the last `tail` log lines of a container
    pub async fn logs(&self, container: &str, tail: usize) -> Result<String, ConnectionError> {
        self.inner
            .command(&format!("docker logs --tail {tail} {container}"))
            .await
    }

    /// List all containers on the host
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, ConnectionError> {
        let output = self.inner.command(LIST_CONTAINERS).await?;
        Ok(parse_container_listing(&output))
    }
}

impl NodeInner {
    pub(crate) fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub(crate) fn reconnect(&self) -> &ReconnectManager {
        &self.reconnect
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state_lock() = state;
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, error: Option<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Record a failure and move to `Error`
    pub(crate) fn mark_error(&self, error: &str) {
        self.set_state(ConnectionState::Error);
        self.set_last_error(Some(error.to_string()));
    }

    /// Park the node after the reconnect budget is spent. Only an explicit
    /// external `connect`/`reconnect` gets it out of this state.
    pub(crate) fn park_exhausted(&self, attempts: u32) {
        let err = ConnectionError::ReconnectExhausted { attempts };
        tracing::error!(node = %self.identity.id, error = %err, "node parked");
        self.mark_error(&err.to_string());
    }

    /// Cancel the monitor and heartbeat of the current session, if any
    pub(crate) fn stop_session(&self) {
        if let Some(token) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    /// Replace the session token, cancelling the previous one
    fn new_session(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    /// Verify that the host's control plane answers.
    ///
    /// Bypasses the connected-state gate: it runs while the node is still
    /// connecting. A link that fails the probe is discarded, not recycled.
    pub(crate) async fn probe(&self) -> Result<String, ConnectionError> {
        let mut lease = self.pool.acquire(&self.identity.id).await?;
        match lease.execute(CONTROL_PLANE_PROBE).await {
            Ok(output) => {
                let version = output.trim().to_string();
                if version.is_empty() {
                    lease.discard().await;
                    return Err(ConnectionError::ProbeFailed(
                        "empty control-plane version response".to_string(),
                    ));
                }
                Ok(version)
            }
            Err(err) => {
                lease.discard().await;
                Err(ConnectionError::Transport(err))
            }
        }
    }

    /// One full connection attempt: probe the control plane, then bring up
    /// the monitor and heartbeat and announce the node.
    ///
    /// Callers manage the `Connecting` transition; this only transitions
    /// to `Connected` on success.
    pub(crate) async fn establish(inner: &Arc<Self>) -> Result<(), ConnectionError> {
        let generation = inner.current_epoch();
        let version = inner.probe().await?;

        // disposal raced the attempt: do not start anything
        if inner.current_epoch() != generation || inner.reconnect.is_shut_down() {
            return Err(ConnectionError::NotConnected);
        }

        let session = inner.new_session();
        EventMonitor::start(
            inner.identity.clone(),
            Arc::clone(&inner.pool),
            Arc::clone(&inner.bus),
            inner.monitor_config.clone(),
            session.clone(),
            Arc::clone(&inner.epoch),
            generation,
        )
        .await?;

        inner.set_state(ConnectionState::Connected);
        inner.set_last_error(None);
        inner
            .reconnect
            .arm_heartbeat(Arc::downgrade(inner), session, generation);
        inner
            .bus
            .publish(&StructuredEvent::node_online(&inner.identity, epoch_millis()));
        tracing::info!(node = %inner.identity.id, %version, "node connected");
        Ok(())
    }

    /// Lease a link, run one command, release the link. Requires
    /// `Connected`; anything else fails immediately with `NotConnected`.
    async fn command(&self, command: &str) -> Result<String, ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let mut lease = self.pool.acquire(&self.identity.id).await?;
        match lease.execute(command).await {
            Ok(output) => Ok(output),
            Err(err) => {
                // the link is suspect; let the pool open a fresh one
                lease.discard().await;
                Err(ConnectionError::Transport(err))
            }
        }
    }
}
