//! Counter and histogram recording for lifecycle hooks
//!
//! [`MetricsRecorder`] is the recording primitive the hook logic depends on.
//! Instruments are addressed by name; the names the hooks emit live in
//! [`names`].

use opentelemetry::KeyValue;
use std::sync::Arc;

/// Core trait for recording metrics
pub trait MetricsRecorder: Send + Sync + std::fmt::Debug {
    /// Record a counter metric (monotonically increasing values)
    fn record_counter(&self, name: &str, value: u64, labels: &[KeyValue]);

    /// Record a histogram metric (durations, costs, window sizes)
    fn record_histogram(&self, name: &str, value: f64, labels: &[KeyValue]);

    /// Increment a counter by 1
    fn increment(&self, name: &str, labels: &[KeyValue]) {
        self.record_counter(name, 1, labels);
    }
}

/// Shared metrics recorder instance
pub type SharedMetricsRecorder = Arc<dyn MetricsRecorder>;

/// Metric names emitted by the hooks
pub mod names {
    /// Tokens consumed, split by `token.type`
    pub const TOKENS: &str = "hooktrace.tokens";
    /// Cost of a model call in USD
    pub const COST_USD: &str = "hooktrace.cost.usd";
    /// Context window tokens in use
    pub const CONTEXT_USED: &str = "hooktrace.context.used_tokens";
    /// Wall time of an agent turn
    pub const TURN_DURATION_MS: &str = "hooktrace.turn.duration_ms";
    /// Completed agent turns
    pub const TURNS: &str = "hooktrace.turns";
    /// Tool executions
    pub const TOOL_CALLS: &str = "hooktrace.tool.calls";
    /// Security detections on tool calls
    pub const SECURITY_DETECTIONS: &str = "hooktrace.security.detections";
    /// Inbound messages seen by the audit hook
    pub const MESSAGES_RECEIVED: &str = "hooktrace.messages.received";
    /// Session start/end events
    pub const SESSIONS: &str = "hooktrace.sessions";
    /// Contexts force-closed by the reaper
    pub const CONTEXTS_REAPED: &str = "hooktrace.contexts.reaped";
}

/// Label keys used on the metrics above
pub mod labels {
    pub const TOKEN_TYPE: &str = "token.type";
    pub const PROVIDER: &str = "gen_ai.provider.name";
    pub const MODEL: &str = "gen_ai.request.model";
    pub const CONTEXT_LIMIT: &str = "context.limit";
    pub const TURN_SUCCESS: &str = "turn.success";
    pub const TOOL_NAME: &str = "gen_ai.tool.name";
    pub const TOOL_STATUS: &str = "tool.status";
    pub const SEVERITY: &str = "security.severity";
    pub const CHANNEL: &str = "channel";
    pub const SESSION_EVENT: &str = "session.event";
    pub const REASON: &str = "reason";
}

/// No-op metrics recorder for when telemetry is disabled
#[derive(Default, Clone, Debug)]
pub struct NoOpMetricsRecorder;

impl MetricsRecorder for NoOpMetricsRecorder {
    fn record_counter(&self, _name: &str, _value: u64, _labels: &[KeyValue]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[KeyValue]) {}
}
