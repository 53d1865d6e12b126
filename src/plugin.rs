//! Plugin lifecycle
//!
//! [`TracePlugin`] wraps a [`HookRouter`] with the background work that has
//! to run alongside it: the stale-context reaper and, optionally, a task that
//! drains the diagnostic usage feed. `gateway_start` starts that work and
//! `gateway_stop` cancels it, force-closes whatever is still open and shuts
//! the exporter pipeline down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HookTraceConfig;
use crate::hooks::{HookContext, HookEventName, HookRouter, SecurityCheck, UsageRecord};
use crate::telemetry::otel::init_pipeline;
use crate::telemetry::{
    NoOpMetricsRecorder, OtelMetricsRecorder, OtelSpanBackend, SharedMetricsRecorder,
    SharedSpanBackend, TelemetryPipeline,
};
use crate::HookTraceError;

/// Trace plugin registered with the host gateway
pub struct TracePlugin {
    router: Arc<HookRouter>,
    pipeline: Mutex<Option<TelemetryPipeline>>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl TracePlugin {
    /// Build a plugin on explicit primitives
    pub fn new(
        config: HookTraceConfig,
        backend: SharedSpanBackend,
        metrics: SharedMetricsRecorder,
        security: Arc<dyn SecurityCheck>,
    ) -> Result<Self, HookTraceError> {
        config.validate()?;
        let router = HookRouter::new(&config, backend, metrics).with_security_check(security);
        Ok(Self::from_router(Arc::new(router), None))
    }

    /// Build a plugin that exports through OpenTelemetry, installing the
    /// OTLP/console pipeline described by `config.telemetry`
    pub fn with_defaults(
        config: HookTraceConfig,
        security: Arc<dyn SecurityCheck>,
    ) -> Result<Self, HookTraceError> {
        config.validate()?;
        let pipeline = init_pipeline(&config.telemetry)?;
        let metrics: SharedMetricsRecorder = if pipeline.is_some() {
            Arc::new(OtelMetricsRecorder::global())
        } else {
            Arc::new(NoOpMetricsRecorder)
        };
        let router = HookRouter::new(&config, Arc::new(OtelSpanBackend::new()), metrics)
            .with_security_check(security);
        Ok(Self::from_router(Arc::new(router), pipeline))
    }

    fn from_router(router: Arc<HookRouter>, pipeline: Option<TelemetryPipeline>) -> Self {
        Self {
            router,
            pipeline: Mutex::new(pipeline),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &Arc<HookRouter> {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the reaper. Must be called from inside a Tokio runtime; calling
    /// it again while running does nothing.
    pub fn start(&self) -> Result<(), HookTraceError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(HookTraceError::initialization_error(
                "trace plugin must be started inside a Tokio runtime",
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Trace plugin already running");
            return Ok(());
        }

        let token = lock(&self.cancel).clone();
        let reaper = self.router.reaper().spawn(Arc::clone(&self.router), token);
        lock(&self.tasks).push(reaper);

        info!(
            sweep_interval_secs = self.router.reaper().sweep_interval().as_secs(),
            stale_after_secs = self.router.reaper().stale_after().as_secs(),
            "Trace plugin started"
        );
        Ok(())
    }

    /// Feed side-channel usage records into the router until the plugin stops
    /// or the sender goes away
    pub fn attach_usage_feed(&self, mut receiver: broadcast::Receiver<UsageRecord>) {
        let router = Arc::clone(&self.router);
        let token = lock(&self.cancel).clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(record) => {
                            router.on_usage(&record);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Usage feed lagged; records were dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Usage feed detached");
        });
        lock(&self.tasks).push(task);
    }

    /// Cancel background work, force-close open contexts and shut the
    /// exporter pipeline down. Returns how many contexts were closed.
    pub async fn stop(&self) -> usize {
        let token = std::mem::take(&mut *lock(&self.cancel));
        token.cancel();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Trace plugin task ended abnormally: {}", e);
            }
        }

        let closed = self.router.close_all();
        if let Some(pipeline) = lock(&self.pipeline).take() {
            pipeline.shutdown();
        }
        self.running.store(false, Ordering::SeqCst);
        info!(closed, "Trace plugin stopped");
        closed
    }

    /// Entry point for every host event. Gateway events drive
    /// [`start`](Self::start) and [`stop`](Self::stop); everything else goes
    /// to the router.
    pub async fn handle_event(&self, name: &str, payload: Value, ctx: &HookContext) {
        match name.parse::<HookEventName>() {
            Ok(HookEventName::GatewayStart) => {
                if let Err(e) = self.start() {
                    warn!("Trace plugin failed to start: {}", e);
                }
            }
            Ok(HookEventName::GatewayStop) => {
                self.stop().await;
            }
            _ => {
                self.router.dispatch(name, payload, ctx);
            }
        }
    }
}

impl std::fmt::Debug for TracePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracePlugin")
            .field("router", &self.router)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for TracePlugin {
    fn drop(&mut self) {
        lock(&self.cancel).cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoSecurityCheck;
    use crate::telemetry::{RecordingMetrics, RecordingSpanBackend};

    fn plugin() -> TracePlugin {
        TracePlugin::new(
            HookTraceConfig::default(),
            Arc::new(RecordingSpanBackend::new()),
            Arc::new(RecordingMetrics::new()),
            Arc::new(NoSecurityCheck),
        )
        .unwrap()
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let plugin = plugin();
        assert!(plugin.start().is_err());
        assert!(!plugin.is_running());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = HookTraceConfig::default();
        config.reaper.stale_after = std::time::Duration::ZERO;
        let result = TracePlugin::new(
            config,
            Arc::new(RecordingSpanBackend::new()),
            Arc::new(RecordingMetrics::new()),
            Arc::new(NoSecurityCheck),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_with_defaults_telemetry_disabled() {
        let plugin =
            TracePlugin::with_defaults(HookTraceConfig::default(), Arc::new(NoSecurityCheck))
                .unwrap();
        plugin
            .handle_event(
                "before_agent_start",
                Value::Null,
                &HookContext::for_session("s1"),
            )
            .await;
        assert!(plugin.router().has_context("s1"));
        assert_eq!(plugin.stop().await, 1);
    }

    #[tokio::test]
    async fn test_gateway_events_drive_lifecycle() {
        let plugin = plugin();
        let ctx = HookContext::default();

        plugin.handle_event("gateway_start", Value::Null, &ctx).await;
        assert!(plugin.is_running());
        // Starting twice is harmless
        plugin.handle_event("gateway_start", Value::Null, &ctx).await;

        plugin.handle_event("gateway_stop", Value::Null, &ctx).await;
        assert!(!plugin.is_running());

        // Restart after stop gets a fresh cancellation token
        plugin.start().unwrap();
        assert!(plugin.is_running());
        plugin.stop().await;
    }
}
