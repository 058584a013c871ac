//! Provider health monitor.
//!
//! Probes the embedding provider with a tiny embed call, caches the result
//! for one check interval, and is the only writer of the provider's health
//! row. Availability changes are published on a watch channel so the job
//! processor can resume paused work as soon as the provider comes back.

use std::sync::Arc;

use chrono::Utc;
use sift_core::{Error, ProviderHealth, Result};
use sift_embed::EmbeddingProvider;
use sift_store::HealthStore;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;

const PROBE_TEXT: &str = "health check";

/// Tracks whether the embedding provider is usable.
pub struct HealthMonitor {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn HealthStore>,
    config: HealthConfig,
    state: Mutex<ProviderHealth>,
    available_tx: watch::Sender<bool>,
}

impl HealthMonitor {
    /// Create a monitor. The provider starts out unavailable and unchecked;
    /// nothing is written until the first probe or reported failure.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn HealthStore>,
        config: HealthConfig,
    ) -> Self {
        let initial = ProviderHealth::new(provider.name());
        let (available_tx, _) = watch::channel(false);
        Self {
            provider,
            store,
            config,
            state: Mutex::new(initial),
            available_tx,
        }
    }

    /// Name of the monitored provider.
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Subscribe to availability changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.available_tx.subscribe()
    }

    /// Snapshot of the current health state.
    pub async fn current(&self) -> ProviderHealth {
        let state = self.state.lock().await.clone();
        state.as_of(self.freshness(), Utc::now())
    }

    /// Every persisted health row, including providers configured earlier.
    ///
    /// A row whose last success is older than one check interval reads as
    /// unavailable: no monitor has confirmed that provider since.
    pub async fn history(&self) -> Result<Vec<ProviderHealth>> {
        let freshness = self.freshness();
        let now = Utc::now();
        Ok(self
            .store
            .list_health()
            .await?
            .into_iter()
            .map(|row| row.as_of(freshness, now))
            .collect())
    }

    /// Probe the provider now and record the result.
    pub async fn probe(&self) -> ProviderHealth {
        let mut state = self.state.lock().await;
        self.probe_locked(&mut state).await;
        state.clone()
    }

    /// Last result if younger than the check interval, otherwise a fresh
    /// probe.
    pub async fn is_available(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.is_fresh(self.freshness(), Utc::now()) {
            self.probe_locked(&mut state).await;
        }
        state.is_available
    }

    /// Record an unavailability observed outside a probe, typically by a
    /// worker whose embed call failed.
    pub async fn report_failure(&self, error: &Error) {
        let mut state = self.state.lock().await;
        let was_available = state.is_available;
        state.record_failure(error.to_string(), Utc::now());
        if was_available {
            warn!(provider = %state.provider, error = %error, "Provider reported unavailable");
        }
        self.persist(&state).await;
        self.publish(false);
    }

    /// Probe every check interval until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            provider = self.provider_name(),
            interval_secs = self.config.check_interval_secs,
            "Health monitor started"
        );
        loop {
            self.probe().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.check_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(provider = self.provider_name(), "Health monitor stopped");
    }

    /// How long a probe result stays valid.
    fn freshness(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.check_interval())
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    async fn probe_locked(&self, state: &mut ProviderHealth) {
        let result = tokio::time::timeout(self.config.timeout(), self.provider.embed(PROBE_TEXT)).await;
        let now = Utc::now();
        let was_available = state.is_available;

        match result {
            Ok(Ok(_)) => {
                state.record_success(now);
                if !was_available {
                    info!(provider = %state.provider, "Provider available");
                }
            }
            Ok(Err(e)) => {
                state.record_failure(e.to_string(), now);
                log_failure(state, was_available);
            }
            Err(_) => {
                state.record_failure(
                    format!("health check timed out after {}s", self.config.timeout_secs),
                    now,
                );
                log_failure(state, was_available);
            }
        }

        self.persist(state).await;
        self.publish(state.is_available);
    }

    async fn persist(&self, state: &ProviderHealth) {
        if let Err(e) = self.store.upsert_health(state).await {
            warn!(provider = %state.provider, error = %e, "Failed to record provider health");
        }
    }

    fn publish(&self, available: bool) {
        self.available_tx.send_if_modified(|current| {
            if *current == available {
                false
            } else {
                *current = available;
                true
            }
        });
    }
}

fn log_failure(state: &ProviderHealth, was_available: bool) {
    let error = state.last_error.as_deref().unwrap_or_default();
    if was_available || state.consecutive_failures == 1 {
        warn!(provider = %state.provider, error, "Provider unavailable");
    } else {
        debug!(
            provider = %state.provider,
            failures = state.consecutive_failures,
            error,
            "Provider still unavailable"
        );
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
