//! Scripted in-memory transport for exercising the fleet end to end
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dh_core::config::{FleetConfig, MonitorConfig, PoolConfig, ReconnectConfig};
use dh_core::error::TransportError;
use dh_core::traits::{CommandTransport, TransportFactory};
use dh_core::types::{ConnectionState, NodeId, NodeIdentity};
use dh_fleet::NodeConnection;

/// Shared scripted state for one fake host. Tests mutate it to inject
/// container listings, event records, and outages.
#[derive(Default)]
pub struct FakeHost {
    /// Rows returned by the listing command, pre-joined
    listing: Mutex<String>,
    /// Event records drained by the next event-tail poll
    events: Mutex<VecDeque<String>>,
    /// When true, opening links and executing commands fail
    down: AtomicBool,
    /// When true, only the event-tail command fails
    fail_events: AtomicBool,
    /// Delay applied to every command, for in-flight overlap tests
    delay: Mutex<Duration>,
    /// Factory open attempts, including refused ones
    open_attempts: AtomicUsize,
    /// Factory opens that succeeded
    opened: AtomicUsize,
    /// Control-plane version probes observed
    probes: AtomicUsize,
    /// Transport closes observed
    closed: AtomicUsize,
    /// Commands observed, in order
    commands: Mutex<Vec<String>>,
    /// Commands currently in flight across all links
    active: AtomicUsize,
    /// High-water mark of concurrently in-flight commands
    max_active: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_listing(&self, rows: &[&str]) {
        *self.listing.lock().unwrap() = rows.join("\n");
    }

    pub fn push_event(&self, line: &str) {
        self.events.lock().unwrap().push_back(line.to_string());
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn respond(&self, command: &str) -> Result<String, TransportError> {
        let delay = *self.delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed("host down".to_string()));
        }
        self.commands.lock().unwrap().push(command.to_string());

        if command.starts_with("docker version") {
            self.probes.fetch_add(1, Ordering::SeqCst);
            return Ok("24.0.7\n".to_string());
        }
        if command.starts_with("docker ps") {
            return Ok(self.listing.lock().unwrap().clone());
        }
        if command.starts_with("docker events") {
            if self.fail_events.load(Ordering::SeqCst) {
                return Err(TransportError::CommandFailed("event log unavailable".to_string()));
            }
            let lines: Vec<String> = self.events.lock().unwrap().drain(..).collect();
            return Ok(lines.join("\n"));
        }
        Ok(format!("ok: {command}"))
    }
}

pub struct FakeLink {
    host: Arc<FakeHost>,
}

#[async_trait]
impl CommandTransport for FakeLink {
    async fn execute(&self, command: &str) -> Result<String, TransportError> {
        let depth = self.host.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.host.max_active.fetch_max(depth, Ordering::SeqCst);
        let result = self.host.respond(command).await;
        self.host.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self) {
        self.host.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    host: Arc<FakeHost>,
}

impl FakeConnector {
    pub fn new(host: &Arc<FakeHost>) -> Arc<Self> {
        Arc::new(Self {
            host: Arc::clone(host),
        })
    }
}

#[async_trait]
impl TransportFactory for FakeConnector {
    async fn open(
        &self,
        _node: &NodeIdentity,
    ) -> Result<Arc<dyn CommandTransport>, TransportError> {
        self.host.open_attempts.fetch_add(1, Ordering::SeqCst);
        if self.host.down.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed("host down".to_string()));
        }
        self.host.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeLink {
            host: Arc::clone(&self.host),
        }))
    }
}

pub fn identity(id: &str) -> NodeIdentity {
    NodeIdentity {
        id: NodeId::new(id),
        name: id.to_string(),
        tags: vec!["test".to_string()],
        host: "127.0.0.1".to_string(),
        port: 22,
        credential: None,
    }
}

/// Tight tuning so paused-clock tests step through whole lifecycles fast.
/// `min_connections` is zero to keep background replenishment out of the
/// open/close counts the tests assert on.
pub fn quick_config() -> FleetConfig {
    FleetConfig {
        pool: PoolConfig {
            max_connections: 3,
            min_connections: 0,
            connection_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
        },
        reconnect: ReconnectConfig {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(5),
            jitter: 0.0,
        },
        monitor: MonitorConfig {
            event_poll_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(30),
        },
        nodes: vec![],
    }
}

/// Poll (in virtual time) until the node reaches the wanted state
pub async fn wait_for_state(connection: &NodeConnection, wanted: ConnectionState) {
    for _ in 0..300 {
        if connection.state() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "timed out waiting for state {wanted}, still {}",
        connection.state()
    );
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
