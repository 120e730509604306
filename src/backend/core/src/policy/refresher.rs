//! Scheduled and on-demand policy refresh.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::PolicyConfig;
use crate::error::{ErrorCode, GatewayError};
use crate::policy::{PolicySnapshot, PolicySource, PolicyStore};

// ═══════════════════════════════════════════════════════════════════════════════
// Refresh Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one refresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot was fetched, compiled, and installed.
    Refreshed { count: usize, version: u64 },
    /// Another refresh was already in flight; its result was adopted.
    Coalesced,
    /// All attempts failed; the previous snapshot remains installed.
    Failed { attempts: u32 },
}

/// Rolling refresh state, for health reporting.
#[derive(Debug, Clone, Default)]
pub struct RefreshStatus {
    /// Completed refresh cycles (successful or not).
    pub cycles: u64,
    /// When the last successful refresh finished.
    pub last_success: Option<DateTime<Utc>>,
    /// Message from the most recent failure, cleared on success.
    pub last_error: Option<String>,
    /// Failed cycles since the last success.
    pub consecutive_failures: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy Refresher
// ═══════════════════════════════════════════════════════════════════════════════

/// Repopulates the [`PolicyStore`] from a [`PolicySource`].
///
/// Refreshes are single-flight: concurrent callers wait for the in-flight
/// cycle and adopt its result instead of issuing duplicate fetches. A failed
/// cycle leaves the previous snapshot in place.
pub struct PolicyRefresher {
    store: Arc<PolicyStore>,
    source: Arc<dyn PolicySource>,
    config: PolicyConfig,
    flight: tokio::sync::Mutex<()>,
    status: RwLock<RefreshStatus>,
}

impl PolicyRefresher {
    pub fn new(store: Arc<PolicyStore>, source: Arc<dyn PolicySource>, config: PolicyConfig) -> Self {
        Self {
            store,
            source,
            config,
            flight: tokio::sync::Mutex::new(()),
            status: RwLock::new(RefreshStatus::default()),
        }
    }

    /// Current refresh state.
    pub fn status(&self) -> RefreshStatus {
        self.status.read().clone()
    }

    /// Run one refresh cycle, or adopt the cycle already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        match self.flight.try_lock() {
            Ok(_guard) => self.run_attempts().await,
            Err(_) => {
                // Wait for the in-flight cycle to finish, then report its
                // completion without fetching again.
                let _guard = self.flight.lock().await;
                counter!("gateway_policy_refresh_total", "outcome" => "coalesced").increment(1);
                RefreshOutcome::Coalesced
            }
        }
    }

    /// Spawn the background refresh loop.
    ///
    /// Sleeps through the startup grace period, refreshes, then re-refreshes
    /// every `refresh_interval` until the shutdown signal fires.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let refresher = Arc::clone(self);

        tokio::spawn(async move {
            info!(
                source = refresher.source.name(),
                grace = ?refresher.config.startup_grace,
                interval = ?refresher.config.refresh_interval,
                "Policy refresher started"
            );

            tokio::select! {
                _ = tokio::time::sleep(refresher.config.startup_grace) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Policy refresher stopped before first refresh");
                        return;
                    }
                }
            }

            let mut ticker = tokio::time::interval(refresher.config.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        refresher.refresh().await;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            info!("Policy refresher shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn run_attempts(&self) -> RefreshOutcome {
        let mut backoff = self.config.backoff_initial;

        for attempt in 1..=self.config.max_attempts {
            let fetched =
                tokio::time::timeout(self.config.attempt_timeout, self.source.fetch()).await;

            let err = match fetched {
                Ok(Ok(policies)) => match PolicySnapshot::build(policies) {
                    Ok(snapshot) => {
                        let count = snapshot.len();
                        let version = self.store.install(snapshot);
                        self.note_success();

                        gauge!("gateway_policies_loaded").set(count as f64);
                        counter!("gateway_policy_refresh_total", "outcome" => "success")
                            .increment(1);
                        info!(
                            count,
                            version,
                            attempt,
                            source = self.source.name(),
                            "Endpoint policies refreshed"
                        );
                        return RefreshOutcome::Refreshed { count, version };
                    }
                    Err(e) => {
                        // The same payload would fail again; end the cycle
                        // and keep serving the current snapshot.
                        error!(
                            error = %e,
                            "Policy payload failed to compile; keeping current snapshot"
                        );
                        self.note_failure(&e);
                        counter!("gateway_policy_refresh_total", "outcome" => "invalid")
                            .increment(1);
                        return RefreshOutcome::Failed { attempts: attempt };
                    }
                },
                Ok(Err(e)) => e,
                Err(_elapsed) => GatewayError::with_internal(
                    ErrorCode::PolicySourceUnavailable,
                    "Policy fetch timed out",
                    format!("attempt {} exceeded {:?}", attempt, self.config.attempt_timeout),
                ),
            };

            warn!(
                attempt,
                max_attempts = self.config.max_attempts,
                error = %err,
                "Policy refresh attempt failed"
            );

            if attempt == self.config.max_attempts {
                self.note_failure(&err);
            } else {
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, self.config.backoff_cap);
            }
        }

        counter!("gateway_policy_refresh_total", "outcome" => "failure").increment(1);
        RefreshOutcome::Failed {
            attempts: self.config.max_attempts,
        }
    }

    fn note_success(&self) {
        let mut status = self.status.write();
        status.cycles += 1;
        status.last_success = Some(Utc::now());
        status.last_error = None;
        status.consecutive_failures = 0;
    }

    fn note_failure(&self, error: &GatewayError) {
        let mut status = self.status.write();
        status.cycles += 1;
        status.last_error = Some(error.to_string());
        status.consecutive_failures += 1;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
