//! Dual-mode container event detection for one connected host
//!
//! Two polling loops feed the bus: a short-interval event tail that
//! reconstructs discrete lifecycle events from the host's event log, and a
//! longer-interval reconciliation pass that re-lists containers as a
//! consistency backstop. Both run inside a single task multiplexed over
//! two timers, so ticks for one host are strictly sequential, the loops
//! start and stop together, and the container snapshot needs no lock: it
//! is owned by the task outright.
//!
//! Delivery is at-least-once. The tail window closes at poll time whether
//! or not records arrived, so a record straddling the boundary can be read
//! twice; state-implying duplicates are suppressed against the snapshot,
//! everything else is the consumer's to deduplicate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use dh_core::config::MonitorConfig;
use dh_core::error::ConnectionError;
use dh_core::events::{epoch_secs, EventAction, StructuredEvent};
use dh_core::output::{is_resolved_name, parse_container_listing, parse_event_batch};
use dh_core::types::{ContainerState, ContainerSummary, NodeIdentity};

use crate::bus::EventBus;
use crate::connection::node::LIST_CONTAINERS;
use crate::connection::pool::ConnectionPool;

/// Monitors one host for container lifecycle changes
pub(crate) struct EventMonitor {
    node: NodeIdentity,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    config: MonitorConfig,
    cancel: CancellationToken,
    /// Owner's disposal counter and the generation this monitor belongs to
    epoch: Arc<AtomicU64>,
    generation: u64,
    /// Container id -> last known state. Exclusively owned by this
    /// monitor; populated before any loop runs.
    snapshot: HashMap<String, ContainerState>,
    /// Tail window lower bound, seconds since the Unix epoch.
    /// Non-decreasing.
    watermark_secs: u64,
}

impl EventMonitor {
    /// Populate the baseline snapshot, then start both polling loops.
    ///
    /// The starting watermark is "now", so no event is ever synthesized
    /// for a container that existed before monitoring began.
    pub(crate) async fn start(
        node: NodeIdentity,
        pool: Arc<ConnectionPool>,
        bus: Arc<EventBus>,
        config: MonitorConfig,
        cancel: CancellationToken,
        epoch: Arc<AtomicU64>,
        generation: u64,
    ) -> Result<(), ConnectionError> {
        let listing = list_containers(&pool, &node).await?;
        let snapshot: HashMap<String, ContainerState> = listing
            .into_iter()
            .map(|container| (container.id, container.state))
            .collect();
        tracing::debug!(
            node = %node.id,
            containers = snapshot.len(),
            "event monitor starting"
        );

        let monitor = Self {
            node,
            pool,
            bus,
            config,
            cancel,
            epoch,
            generation,
            snapshot,
            watermark_secs: epoch_secs(),
        };
        tokio::spawn(monitor.run());
        Ok(())
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();

        let poll = self.config.event_poll_interval;
        let mut tail = interval_at(Instant::now() + poll, poll);
        tail.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reconcile = self.config.reconcile_interval;
        let mut backstop = interval_at(Instant::now() + reconcile, reconcile);
        backstop.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tail.tick() => {
                    if self.stale() {
                        break;
                    }
                    self.poll_events().await;
                }
                _ = backstop.tick() => {
                    if self.stale() {
                        break;
                    }
                    self.reconcile().await;
                }
            }
        }
        tracing::debug!(node = %self.node.id, "event monitor stopped");
    }

    /// Whether the owning node has been disposed since this monitor
    /// started. Checked at the top of every tick.
    fn stale(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) != self.generation
    }

    /// Query the event log for the window since the watermark and publish
    /// whatever survives parsing and filtering. A transport failure is
    /// absorbed: nothing is emitted, nothing is mutated, the next tick
    /// retries.
    async fn poll_events(&mut self) {
        let until = epoch_secs();
        let command = format!(
            "docker events --since {since} --until {until} --filter type=container \
             --format '{{{{.Type}}}}|{{{{.Action}}}}|{{{{.Actor.ID}}}}|{{{{.Actor.Attributes.name}}}}|{{{{.Actor.Attributes.image}}}}|{{{{.Time}}}}000'",
            since = self.watermark_secs,
        );
        let output = match self.command(&command).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(node = %self.node.id, error = %err, "event poll failed");
                return;
            }
        };

        let (events, skipped) = parse_event_batch(&output);
        if skipped > 0 {
            tracing::warn!(node = %self.node.id, skipped, "dropped malformed event records");
        }
        for event in events {
            self.handle_event(event);
        }

        // the window closes at poll time even when it was empty
        self.watermark_secs = until;
    }

    /// Apply whitelist, name, and duplicate filters, update the snapshot,
    /// and publish
    fn handle_event(&mut self, event: StructuredEvent) {
        if !event.action.is_lifecycle() {
            tracing::debug!(node = %self.node.id, action = %event.action, "ignoring non-lifecycle action");
            return;
        }
        if !is_resolved_name(&event.actor.attributes.name) {
            tracing::debug!(node = %self.node.id, container = %event.actor.id, "ignoring event with unresolved name");
            return;
        }

        if event.action == EventAction::Destroy {
            self.snapshot.remove(&event.actor.id);
        } else if let Some(state) = event.action.implied_state() {
            let previous = self.snapshot.insert(event.actor.id.clone(), state);
            if previous == Some(state) {
                // boundary-overlap duplicate of an event already delivered
                tracing::debug!(
                    node = %self.node.id,
                    container = %event.actor.id,
                    action = %event.action,
                    "suppressing duplicate event"
                );
                return;
            }
        }

        self.bus.publish(&event);
    }

    /// Consistency backstop: re-list containers and refresh the snapshot.
    /// Logs drift, publishes nothing.
    async fn reconcile(&mut self) {
        let listing = match list_containers(&self.pool, &self.node).await {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(node = %self.node.id, error = %err, "reconciliation poll failed");
                return;
            }
        };
        let fresh: HashMap<String, ContainerState> = listing
            .into_iter()
            .map(|container| (container.id, container.state))
            .collect();

        for (id, state) in &fresh {
            match self.snapshot.get(id) {
                Some(previous) if previous == state => {}
                Some(previous) => tracing::debug!(
                    node = %self.node.id,
                    container = %id,
                    from = %previous,
                    to = %state,
                    "snapshot drift observed outside the event tail"
                ),
                None => tracing::debug!(
                    node = %self.node.id,
                    container = %id,
                    state = %state,
                    "container appeared outside the event tail"
                ),
            }
        }
        for id in self.snapshot.keys() {
            if !fresh.contains_key(id) {
                tracing::debug!(
                    node = %self.node.id,
                    container = %id,
                    "container removed outside the event tail"
                );
            }
        }

        self.snapshot = fresh;
    }

    async fn command(&self, command: &str) -> Result<String, ConnectionError> {
        run_command(&self.pool, &self.node, command).await
    }
}

/// Lease a link, run one command, release the link
async fn run_command(
    pool: &ConnectionPool,
    node: &NodeIdentity,
    command: &str,
) -> Result<String, ConnectionError> {
    let mut lease = pool.acquire(&node.id).await?;
    match lease.execute(command).await {
        Ok(output) => Ok(output),
        Err(err) => {
            lease.discard().await;
            Err(ConnectionError::Transport(err))
        }
    }
}

/// Full container listing used for snapshot population and reconciliation
async fn list_containers(
    pool: &ConnectionPool,
    node: &NodeIdentity,
) -> Result<Vec<ContainerSummary>, ConnectionError> {
    let output = run_command(pool, node, LIST_CONTAINERS).await?;
    Ok(parse_container_listing(&output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dh_core::config::PoolConfig;
    use dh_core::error::TransportError;
    use dh_core::events::EventKind;
    use dh_core::traits::{CommandTransport, TransportFactory};
    use dh_core::types::NodeId;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    /// Transport that serves a fixed listing and a scripted batch of
    /// event lines
    struct ScriptedHost {
        listing: StdMutex<String>,
        events: StdMutex<String>,
        down: AtomicBool,
    }

    struct ScriptedTransport {
        host: Arc<ScriptedHost>,
    }

    #[async_trait]
    impl CommandTransport for ScriptedTransport {
        async fn execute(&self, command: &str) -> Result<String, TransportError> {
            if self.host.down.load(Ordering::SeqCst) {
                return Err(TransportError::SessionClosed("host down".to_string()));
            }
            if command.starts_with("docker ps") {
                return Ok(self.host.listing.lock().unwrap().clone());
            }
            if command.starts_with("docker events") {
                return Ok(std::mem::take(&mut *self.host.events.lock().unwrap()));
            }
            Ok(String::new())
        }

        async fn close(&self) {}
    }

    struct ScriptedFactory {
        host: Arc<ScriptedHost>,
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn open(
            &self,
            _node: &NodeIdentity,
        ) -> Result<Arc<dyn CommandTransport>, TransportError> {
            Ok(Arc::new(ScriptedTransport {
                host: Arc::clone(&self.host),
            }))
        }
    }

    fn scripted(listing: &str) -> (Arc<ScriptedHost>, Arc<ConnectionPool>, NodeIdentity) {
        let host = Arc::new(ScriptedHost {
            listing: StdMutex::new(listing.to_string()),
            events: StdMutex::new(String::new()),
            down: AtomicBool::new(false),
        });
        let pool = Arc::new(ConnectionPool::new(Arc::new(ScriptedFactory {
            host: Arc::clone(&host),
        })));
        let node = NodeIdentity {
            id: NodeId::new("n1"),
            name: "n1".to_string(),
            tags: vec![],
            host: "127.0.0.1".to_string(),
            port: 22,
            credential: None,
        };
        pool.register(node.clone(), PoolConfig::default());
        (host, pool, node)
    }

    fn monitor_under_test(
        pool: Arc<ConnectionPool>,
        node: NodeIdentity,
        bus: Arc<EventBus>,
        snapshot: HashMap<String, ContainerState>,
    ) -> EventMonitor {
        EventMonitor {
            node,
            pool,
            bus,
            config: MonitorConfig::default(),
            cancel: CancellationToken::new(),
            epoch: Arc::new(AtomicU64::new(0)),
            generation: 0,
            snapshot,
            watermark_secs: 0,
        }
    }

    fn collecting_bus() -> (Arc<EventBus>, Arc<StdMutex<Vec<StructuredEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| {
                seen.lock().unwrap().push(event.clone());
                Ok(())
            });
        }
        (bus, seen)
    }

    #[tokio::test]
    async fn test_poll_publishes_parsed_events_and_advances_watermark() {
        let (host, pool, node) = scripted("");
        let (bus, seen) = collecting_bus();
        let mut monitor = monitor_under_test(pool, node, bus, HashMap::new());

        *host.events.lock().unwrap() =
            "container|start|abc123|web|nginx:latest|1700000000000".to_string();
        monitor.poll_events().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, EventKind::Container);
        assert_eq!(seen[0].action, EventAction::Start);
        assert_eq!(seen[0].actor.attributes.image, "nginx:latest");
        assert!(monitor.watermark_secs > 0, "watermark advances to poll time");
        assert_eq!(
            monitor.snapshot.get("abc123"),
            Some(&ContainerState::Running)
        );
    }

    #[tokio::test]
    async fn test_malformed_row_does_not_block_the_batch() {
        let (host, pool, node) = scripted("");
        let (bus, seen) = collecting_bus();
        let mut monitor = monitor_under_test(pool, node, bus, HashMap::new());

        *host.events.lock().unwrap() = "\
container|start|abc123|web|nginx:latest|1700000000000
garbage
container|die|def456|db|postgres:16|1700000001000"
            .to_string();
        monitor.poll_events().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].action, EventAction::Die);
    }

    #[tokio::test]
    async fn test_duplicate_state_events_are_suppressed() {
        let (host, pool, node) = scripted("");
        let (bus, seen) = collecting_bus();
        let snapshot: HashMap<String, ContainerState> =
            [("abc123".to_string(), ContainerState::Running)].into();
        let mut monitor = monitor_under_test(pool, node, bus, snapshot);

        // a start for an already-running container is a window-overlap echo
        *host.events.lock().unwrap() =
            "container|start|abc123|web|nginx:latest|1700000000000".to_string();
        monitor.poll_events().await;
        assert!(seen.lock().unwrap().is_empty());

        // a die is a real transition and goes through
        *host.events.lock().unwrap() =
            "container|die|abc123|web|nginx:latest|1700000002000".to_string();
        monitor.poll_events().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_status_always_publishes() {
        let (host, pool, node) = scripted("");
        let (bus, seen) = collecting_bus();
        let snapshot: HashMap<String, ContainerState> =
            [("abc123".to_string(), ContainerState::Running)].into();
        let mut monitor = monitor_under_test(pool, node, bus, snapshot);

        *host.events.lock().unwrap() =
            "container|health_status: healthy|abc123|web|nginx:latest|1700000000000\n\
             container|health_status: healthy|abc123|web|nginx:latest|1700000005000"
                .to_string();
        monitor.poll_events().await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_names_and_unknown_actions_are_dropped() {
        let (host, pool, node) = scripted("");
        let (bus, seen) = collecting_bus();
        let mut monitor = monitor_under_test(pool, node, bus, HashMap::new());

        *host.events.lock().unwrap() = "\
container|start|abc123|<no value>|nginx:latest|1700000000000
container|exec_create: /bin/sh|def456|db|postgres:16|1700000001000"
            .to_string();
        monitor.poll_events().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_from_snapshot_and_publishes() {
        let (host, pool, node) = scripted("");
        let (bus, seen) = collecting_bus();
        let snapshot: HashMap<String, ContainerState> =
            [("abc123".to_string(), ContainerState::Stopped)].into();
        let mut monitor = monitor_under_test(pool, node, bus, snapshot);

        *host.events.lock().unwrap() =
            "container|destroy|abc123|web|nginx:latest|1700000000000".to_string();
        monitor.poll_events().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!monitor.snapshot.contains_key("abc123"));
    }

    #[tokio::test]
    async fn test_failed_poll_is_absorbed() {
        let (host, pool, node) = scripted("");
        let (bus, seen) = collecting_bus();
        let mut monitor = monitor_under_test(pool, node, bus, HashMap::new());
        monitor.watermark_secs = 42;

        host.down.store(true, Ordering::SeqCst);
        monitor.poll_events().await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(
            monitor.watermark_secs, 42,
            "watermark must not advance on a failed poll"
        );
    }

    #[tokio::test]
    async fn test_start_populates_snapshot_from_listing() {
        let (_host, pool, node) = scripted("abc123|web|running|nginx:latest\ndef456|db|exited|postgres:16");
        let (bus, seen) = collecting_bus();

        EventMonitor::start(
            node,
            pool,
            bus,
            MonitorConfig::default(),
            CancellationToken::new(),
            Arc::new(AtomicU64::new(0)),
            0,
        )
        .await
        .unwrap();

        // populating the baseline snapshot publishes nothing
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_refreshes_snapshot_without_publishing() {
        let (host, pool, node) = scripted("abc123|web|exited|nginx:latest");
        let (bus, seen) = collecting_bus();
        let snapshot: HashMap<String, ContainerState> = [
            ("abc123".to_string(), ContainerState::Running),
            ("gone".to_string(), ContainerState::Running),
        ]
        .into();
        let mut monitor = monitor_under_test(pool, node, bus, snapshot);

        monitor.reconcile().await;

        assert!(seen.lock().unwrap().is_empty(), "backstop never publishes");
        assert_eq!(
            monitor.snapshot.get("abc123"),
            Some(&ContainerState::Stopped)
        );
        assert!(!monitor.snapshot.contains_key("gone"));
        drop(host);
    }
}
