//! Stale-Context Reaper
//!
//! Turn end is not guaranteed to fire: the host can crash, drop the event,
//! or serve a channel that never emits it. The reaper periodically removes
//! contexts older than a threshold and ends their spans so neither the store
//! nor the set of open spans grows without bound.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::router::HookRouter;
use super::store::{SessionContextStore, SessionTraceContext};
use super::usage::UsageLedger;
use crate::config::ReaperConfig;
use crate::telemetry::genai::attrs;

/// Why a context was force-closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Older than the staleness threshold
    Stale,
    /// Plugin shutting down
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Periodic sweep settings and logic
#[derive(Debug, Clone)]
pub struct StaleContextReaper {
    sweep_interval: Duration,
    stale_after: Duration,
}

impl StaleContextReaper {
    pub fn new(config: &ReaperConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval,
            stale_after: config.stale_after,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Remove every stale context from the store and release its side-table
    /// entry. Pending usage older than the threshold is dropped as well.
    /// The returned contexts still hold open spans; pass them to
    /// [`force_close`](Self::force_close) once the store lock is released.
    pub fn collect_stale(
        &self,
        store: &mut SessionContextStore,
        usage: &mut UsageLedger,
        now: DateTime<Utc>,
    ) -> Vec<SessionTraceContext> {
        let stale: Vec<SessionTraceContext> = store
            .stale_keys(now, self.stale_after)
            .iter()
            .filter_map(|key| {
                usage.release(key);
                store.delete(key)
            })
            .collect();

        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold));
        if let Some(cutoff) = cutoff {
            let expired = usage.expire_pending(cutoff);
            if expired > 0 {
                debug!(expired, "Dropped unclaimed pending usage records");
            }
        }

        stale
    }

    /// End the agent span and, when it is a separate span, the root span.
    /// Status is left untouched.
    pub fn force_close(context: SessionTraceContext, reason: CloseReason) {
        let session_key = context.session_key().to_string();
        let distinct_root = context.has_distinct_root();
        let (root, agent) = context.into_spans();
        let marker = KeyValue::new(attrs::FORCE_CLOSED, reason.as_str());

        if let Some(agent) = agent {
            agent.set_attribute(marker.clone());
            agent.end();
        }
        if distinct_root {
            root.set_attribute(marker);
            root.end();
        }
        debug!(session_key = %session_key, reason = reason.as_str(), "Force-closed trace context");
    }

    /// Run the sweep on a fixed interval until `cancel` fires
    pub fn spawn(&self, router: Arc<HookRouter>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; sweeps start one period in.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = router.sweep_stale();
                        if reaped > 0 {
                            info!(reaped, "Reaped stale trace contexts");
                        }
                    }
                }
            }
            debug!("Stale-context reaper stopped");
        })
    }
}

impl Default for StaleContextReaper {
    fn default() -> Self {
        Self::new(&ReaperConfig::default())
    }
}
