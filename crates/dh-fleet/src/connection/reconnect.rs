//! Long-horizon reconnection policy and connection heartbeat
//!
//! `NodeConnection::connect` owns the short burst of immediate attempts;
//! everything after that burst belongs here. The handoff is
//! one-directional: once recovery starts, this manager is the only caller
//! of further reconnect attempts for its host, so two retry policies can
//! never race each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use dh_core::config::ReconnectConfig;
use dh_core::types::ConnectionState;

use super::node::NodeInner;

/// Exponential backoff with optional jitter for reconnection attempts
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Delay restored by `reset`
    initial: Duration,
    /// Maximum delay
    max: Duration,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay, config.max_delay, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            current: initial,
            initial,
            max,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Double the delay, capped at the maximum
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);

        if self.jitter > 0.0 {
            let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
            delay + Duration::from_secs_f64(jitter_amount)
        } else {
            delay
        }
    }

    /// Reset the backoff to its initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Recovery bookkeeping for one host
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made in the current recovery episode
    pub attempts: u32,
    /// Delay preceding the most recent attempt
    pub current_delay: Duration,
    /// Error recorded by the most recent failure
    pub last_error: Option<String>,
}

/// Drives long-horizon recovery and the connected-state heartbeat for one
/// host. Owned by that host's `NodeConnection`; never shared across hosts.
pub(crate) struct ReconnectManager {
    config: ReconnectConfig,
    /// Cancelled exactly once, on disposal
    cancel: CancellationToken,
    /// True while a recovery loop is running; guarantees one at a time
    recovering: AtomicBool,
    retry: Mutex<RetryState>,
}

impl ReconnectManager {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            recovering: AtomicBool::new(false),
            retry: Mutex::new(RetryState::default()),
        }
    }

    /// Snapshot of the current recovery bookkeeping
    pub(crate) fn retry_state(&self) -> RetryState {
        self.retry_lock().clone()
    }

    pub(crate) fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the heartbeat and any pending recovery attempt. After this
    /// returns, no attempt will fire: every scheduled tick checks the
    /// token (and the node epoch) before acting.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn retry_lock(&self) -> MutexGuard<'_, RetryState> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_retry(&self, update: impl FnOnce(&mut RetryState)) {
        update(&mut self.retry_lock());
    }

    fn clear_recovering(&self) {
        self.recovering.store(false, Ordering::SeqCst);
    }

    /// Arm the liveness heartbeat for a freshly connected node.
    ///
    /// The probe runs at the configured interval for as long as the node
    /// stays connected and the session token stays live; the first failed
    /// probe hands the host to the recovery loop and stops the heartbeat.
    pub(crate) fn arm_heartbeat(
        &self,
        node: Weak<NodeInner>,
        session: CancellationToken,
        generation: u64,
    ) {
        let period = self.config.heartbeat_interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = session.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(node) = node.upgrade() else { break };
                        if node.current_epoch() != generation {
                            break;
                        }
                        if node.state() != ConnectionState::Connected {
                            break;
                        }
                        if let Err(err) = node.probe().await {
                            tracing::warn!(
                                node = %node.identity().id,
                                error = %err,
                                "heartbeat probe failed, starting recovery"
                            );
                            node.mark_error(&err.to_string());
                            node.stop_session();
                            node.reconnect()
                                .begin_recovery(Arc::downgrade(&node), generation, err.to_string());
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Start the backoff-driven recovery loop for a host that lost
    /// connectivity. At most one loop runs per host; later triggers while
    /// one is active are ignored.
    pub(crate) fn begin_recovery(&self, node: Weak<NodeInner>, generation: u64, reason: String) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_retry(|retry| {
            *retry = RetryState {
                attempts: 0,
                current_delay: self.config.initial_delay,
                last_error: Some(reason),
            };
        });

        let config = self.config.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut backoff = ExponentialBackoff::from_config(&config);
            let mut attempts: u32 = 0;

            loop {
                if config.max_attempts != 0 && attempts >= config.max_attempts {
                    if let Some(node) = node.upgrade() {
                        node.reconnect().clear_recovering();
                        node.park_exhausted(attempts);
                    }
                    return;
                }

                let delay = backoff.next_delay();
                attempts += 1;
                if let Some(node) = node.upgrade() {
                    node.reconnect().set_retry(|retry| {
                        retry.attempts = attempts;
                        retry.current_delay = delay;
                    });
                }
                tracing::info!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect attempt"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(node) = node.upgrade() else { return };
                if cancel.is_cancelled() || node.current_epoch() != generation {
                    return;
                }
                if node.state() != ConnectionState::Error {
                    // an explicit disconnect or connect landed mid-recovery;
                    // cede to it rather than race a second attempt
                    node.reconnect().clear_recovering();
                    return;
                }

                node.set_state(ConnectionState::Connecting);
                match NodeInner::establish(&node).await {
                    Ok(()) => {
                        tracing::info!(node = %node.identity().id, attempts, "reconnected");
                        node.reconnect().set_retry(|retry| retry.last_error = None);
                        node.reconnect().clear_recovering();
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(
                            node = %node.identity().id,
                            attempt = attempts,
                            error = %err,
                            "reconnect attempt failed"
                        );
                        node.mark_error(&err.to_string());
                        node.reconnect()
                            .set_retry(|retry| retry.last_error = Some(err.to_string()));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(60_000),
            0.0, // no jitter for a deterministic sequence
        );

        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16_000, 32_000, 60_000, 60_000]
        );
    }

    #[test]
    fn test_backoff_reset_restores_initial_delay() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.5);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(10));
        assert!(delay <= Duration::from_secs(15));
    }

    #[test]
    fn test_manager_starts_idle() {
        let manager = ReconnectManager::new(ReconnectConfig::default());
        assert!(!manager.is_recovering());
        assert!(!manager.is_shut_down());
        assert_eq!(manager.retry_state().attempts, 0);
    }

    #[test]
    fn test_shutdown_is_sticky() {
        let manager = ReconnectManager::new(ReconnectConfig::default());
        manager.shutdown();
        assert!(manager.is_shut_down());
    }
}
