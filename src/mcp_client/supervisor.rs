//! Opt-in background reconnection.
//!
//! Reconnection is caller-initiated unless the application starts a
//! supervisor. The supervisor only touches servers that are `enabled`, have
//! `auto_reconnect` set, still have a connection entry (an explicit
//! disconnect removes it) and are currently down. Attempts back off
//! exponentially and stop after `max_attempts` until an explicit connect
//! resets the counter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::manager::ClientManager;

/// Maximum reconnect attempts before giving up on a server.
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between reconnect attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// How often the supervisor looks for downed servers.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Seconds between sweeps.
    pub interval_secs: u64,
    pub max_attempts: u32,
    /// Backoff base in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL.as_secs(),
            max_attempts: MAX_RESTART_ATTEMPTS,
            base_delay_ms: RESTART_BASE_DELAY.as_millis() as u64,
        }
    }
}

impl SupervisorConfig {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Delay before attempt number `attempt + 1`: base, 2×base, 4×base, …
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms).saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Stops the supervisor when dropped.
pub struct SupervisorHandle {
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ClientManager {
    /// Start the reconnect supervisor on the current tokio runtime.
    pub fn spawn_supervisor(self: &Arc<Self>, config: SupervisorConfig) -> SupervisorHandle {
        let manager = Arc::clone(self);
        tracing::info!(
            interval_secs = config.interval_secs,
            max_attempts = config.max_attempts,
            "starting reconnect supervisor"
        );
        SupervisorHandle {
            task: tokio::spawn(run(manager, config)),
        }
    }
}

async fn run(manager: Arc<ClientManager>, config: SupervisorConfig) {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut not_before: HashMap<String, Instant> = HashMap::new();

    loop {
        ticker.tick().await;
        sweep(&manager, &config, &mut not_before).await;
    }
}

/// One pass over the reconnect candidates.
async fn sweep(
    manager: &ClientManager,
    config: &SupervisorConfig,
    not_before: &mut HashMap<String, Instant>,
) {
    let candidates = manager.reconnect_candidates();
    not_before.retain(|id, _| candidates.contains(id));

    for server_id in candidates {
        let attempts = manager.reconnect_attempts(&server_id);
        if attempts >= config.max_attempts {
            continue;
        }
        if not_before.get(&server_id).is_some_and(|t| Instant::now() < *t) {
            continue;
        }

        tracing::info!(server = %server_id, attempt = attempts + 1, "attempting reconnect");
        match manager.supervised_reconnect(&server_id).await {
            Some(Ok(())) => {
                tracing::info!(server = %server_id, "reconnected");
                not_before.remove(&server_id);
            }
            Some(Err(e)) => {
                let attempts = manager.reconnect_attempts(&server_id);
                if attempts >= config.max_attempts {
                    tracing::error!(
                        server = %server_id,
                        attempts,
                        error = %e,
                        "giving up on reconnect"
                    );
                } else {
                    let delay = config.backoff(attempts);
                    tracing::warn!(
                        server = %server_id,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "reconnect failed"
                    );
                    not_before.insert(server_id, Instant::now() + delay);
                }
            }
            None => {}
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
