//! Lifecycle event router
//!
//! [`HookRouter`] owns the session store and usage ledger and turns each host
//! event into span and metric operations. Every handler runs behind a fault
//! boundary: decoding errors, primitive failures and panics are logged and
//! swallowed so the host never sees them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::content;
use super::events::{
    resolve_agent_id, resolve_session_key, HookContext, HookEventName, MessageReceivedEvent,
    SessionEvent, ToolExecutionEvent, TurnEndEvent, TurnStartEvent, UsageRecord, UNKNOWN,
};
use super::reaper::{CloseReason, StaleContextReaper};
use super::security::{NoSecurityCheck, SecurityCheck};
use super::store::{SessionContextStore, SessionTraceContext};
use super::usage::{record_usage_metrics, UsageDisposition, UsageLedger, UsageSnapshot};
use crate::config::HookTraceConfig;
use crate::telemetry::genai::{attrs, span_names, GenAiOperation};
use crate::telemetry::metrics::{labels, names};
use crate::telemetry::{SharedMetricsRecorder, SharedSpanBackend, SpanHandle};
use crate::utils::logging::{single_line_preview, truncate_checked, truncate_string};
use crate::HookTraceError;

/// Label used in fault logs for side-channel usage records
const USAGE_HANDLER: &str = "diagnostic_usage";

type EventHandler = fn(&HookRouter, Value, &HookContext) -> Result<(), HookTraceError>;

/// Content and truncation settings the handlers apply
#[derive(Debug, Clone)]
pub struct HookSettings {
    pub capture_content: bool,
    pub max_content_chars: usize,
    pub max_error_chars: usize,
    pub max_security_preview_chars: usize,
}

impl From<&HookTraceConfig> for HookSettings {
    fn from(config: &HookTraceConfig) -> Self {
        Self {
            capture_content: config.capture_content,
            max_content_chars: config.max_content_chars,
            max_error_chars: config.max_error_chars,
            max_security_preview_chars: config.max_security_preview_chars,
        }
    }
}

/// Mutable state shared by every handler
#[derive(Debug, Default)]
struct HookState {
    store: SessionContextStore,
    usage: UsageLedger,
}

/// Routes lifecycle events to span and metric operations
pub struct HookRouter {
    settings: HookSettings,
    backend: SharedSpanBackend,
    metrics: SharedMetricsRecorder,
    security: Arc<dyn SecurityCheck>,
    reaper: StaleContextReaper,
    state: Mutex<HookState>,
    handlers: HashMap<HookEventName, EventHandler>,
}

impl HookRouter {
    pub fn new(
        config: &HookTraceConfig,
        backend: SharedSpanBackend,
        metrics: SharedMetricsRecorder,
    ) -> Self {
        let mut handlers: HashMap<HookEventName, EventHandler> = HashMap::new();
        handlers.insert(HookEventName::BeforeAgentStart, dispatch_turn_start);
        handlers.insert(HookEventName::ToolResultPersist, dispatch_tool_execution);
        handlers.insert(HookEventName::AgentEnd, dispatch_turn_end);
        handlers.insert(HookEventName::MessageReceived, dispatch_message_received);
        handlers.insert(HookEventName::SessionStart, dispatch_session_start);
        handlers.insert(HookEventName::SessionEnd, dispatch_session_end);

        Self {
            settings: HookSettings::from(config),
            backend,
            metrics,
            security: Arc::new(NoSecurityCheck),
            reaper: StaleContextReaper::new(&config.reaper),
            state: Mutex::new(HookState::default()),
            handlers,
        }
    }

    /// Replace the security check consulted on every tool call
    pub fn with_security_check(mut self, security: Arc<dyn SecurityCheck>) -> Self {
        self.security = security;
        self
    }

    pub fn settings(&self) -> &HookSettings {
        &self.settings
    }

    pub fn reaper(&self) -> &StaleContextReaper {
        &self.reaper
    }

    /// Route a raw event by name. Returns `false` for names this router does
    /// not handle (unknown events and the gateway lifecycle events, which the
    /// plugin handles itself).
    pub fn dispatch(&self, name: &str, payload: Value, ctx: &HookContext) -> bool {
        let event = match name.parse::<HookEventName>() {
            Ok(event) => event,
            Err(_) => {
                debug!(event = name, "Ignoring unknown hook event");
                return false;
            }
        };

        let Some(handler) = self.handlers.get(&event).copied() else {
            debug!(event = %event, "Event is handled by the plugin lifecycle");
            return false;
        };

        self.guarded(event.as_str(), || handler(self, payload, ctx));
        true
    }

    /// `before_agent_start`
    pub fn on_turn_start(&self, event: &TurnStartEvent, ctx: &HookContext) {
        self.guarded(HookEventName::BeforeAgentStart.as_str(), || {
            self.turn_start(event, ctx)
        });
    }

    /// `tool_result_persist`
    pub fn on_tool_execution(&self, event: &ToolExecutionEvent, ctx: &HookContext) {
        self.guarded(HookEventName::ToolResultPersist.as_str(), || {
            self.tool_execution(event, ctx)
        });
    }

    /// `agent_end`
    pub fn on_turn_end(&self, event: &TurnEndEvent, ctx: &HookContext) {
        self.guarded(HookEventName::AgentEnd.as_str(), || self.turn_end(event, ctx));
    }

    /// `message_received`
    pub fn on_message_received(&self, event: &MessageReceivedEvent, ctx: &HookContext) {
        self.guarded(HookEventName::MessageReceived.as_str(), || {
            self.message_received(event, ctx)
        });
    }

    /// `session_start`
    pub fn on_session_start(&self, event: &SessionEvent, ctx: &HookContext) {
        self.guarded(HookEventName::SessionStart.as_str(), || {
            self.session_event(HookEventName::SessionStart, event, ctx)
        });
    }

    /// `session_end`
    pub fn on_session_end(&self, event: &SessionEvent, ctx: &HookContext) {
        self.guarded(HookEventName::SessionEnd.as_str(), || {
            self.session_event(HookEventName::SessionEnd, event, ctx)
        });
    }

    /// A usage record from the diagnostic side channel. Returns where the
    /// record went, or `None` if handling failed.
    pub fn on_usage(&self, record: &UsageRecord) -> Option<UsageDisposition> {
        self.guarded(USAGE_HANDLER, || self.usage_record(record, Utc::now()))
    }

    /// Force-close every context older than the staleness threshold.
    /// Returns how many were closed.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Utc::now())
    }

    /// [`sweep_stale`](Self::sweep_stale) against an explicit clock
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> usize {
        self.guarded("reaper_sweep", || {
            let stale = {
                let mut state = self.lock_state();
                let HookState { store, usage } = &mut *state;
                self.reaper.collect_stale(store, usage, now)
            };
            Ok(self.close_contexts(stale, CloseReason::Stale))
        })
        .unwrap_or(0)
    }

    /// Force-close every open context and clear the usage ledger
    pub fn close_all(&self) -> usize {
        self.guarded("close_all", || {
            let open = {
                let mut state = self.lock_state();
                state.usage.clear();
                state.store.drain()
            };
            Ok(self.close_contexts(open, CloseReason::Shutdown))
        })
        .unwrap_or(0)
    }

    /// Number of sessions with a turn in flight
    pub fn active_sessions(&self) -> usize {
        self.lock_state().store.len()
    }

    pub fn has_context(&self, session_key: &str) -> bool {
        self.lock_state().store.contains(session_key)
    }

    pub fn has_pending_usage(&self, session_key: &str) -> bool {
        self.lock_state().usage.pending(session_key).is_some()
    }

    pub fn has_live_span(&self, session_key: &str) -> bool {
        self.lock_state().usage.has_live_span(session_key)
    }

    fn turn_start(&self, event: &TurnStartEvent, ctx: &HookContext) -> Result<(), HookTraceError> {
        let session_key = resolve_session_key(event.session_key.as_ref(), ctx);
        let agent_id = resolve_agent_id(event.agent_id.as_ref(), ctx);
        let now = Utc::now();

        let mut state = self.lock_state();

        if !state.store.contains(&session_key) {
            let mut root_attributes = vec![KeyValue::new(attrs::SESSION_ID, session_key.clone())];
            if let Some(channel) = ctx
                .channel_id
                .as_ref()
                .or(ctx.message_provider.as_ref())
            {
                root_attributes.push(KeyValue::new(attrs::CHANNEL, channel.clone()));
            }
            let root = SpanHandle::start(
                self.backend.as_ref(),
                span_names::REQUEST,
                SpanKind::Server,
                root_attributes,
                None,
            );
            state
                .store
                .put(SessionTraceContext::new(session_key.clone(), root, now));
        }

        let Some(context) = state.store.get_mut(&session_key) else {
            return Err(HookTraceError::span_error(format!(
                "trace context for '{}' vanished during turn start",
                session_key
            )));
        };

        let mut agent_attributes = vec![
            KeyValue::new(attrs::OPERATION_NAME, GenAiOperation::InvokeAgent.as_str()),
            KeyValue::new(attrs::AGENT_ID, agent_id.clone()),
            KeyValue::new(attrs::SESSION_ID, session_key.clone()),
        ];
        if let Some(ref model) = event.model {
            agent_attributes.push(KeyValue::new(attrs::REQUEST_MODEL, model.clone()));
        }
        if let Some(ref provider) = event.provider {
            agent_attributes.push(KeyValue::new(attrs::PROVIDER_NAME, provider.clone()));
        }

        let agent = SpanHandle::start(
            self.backend.as_ref(),
            &GenAiOperation::InvokeAgent.span_name(&agent_id),
            SpanKind::Internal,
            agent_attributes,
            Some(context.root_context()),
        );

        if let Some(superseded) = context.replace_agent(agent.clone(), event.model.clone()) {
            debug!(session_key = %session_key, "New turn started before the previous one ended");
            superseded.end();
        }
        let turns = context.turns();

        let attached_pending = state.usage.register_live_span(&session_key, agent);
        debug!(
            session_key = %session_key,
            agent_id = %agent_id,
            turns,
            attached_pending,
            "Agent turn span started"
        );
        Ok(())
    }

    fn tool_execution(
        &self,
        event: &ToolExecutionEvent,
        ctx: &HookContext,
    ) -> Result<(), HookTraceError> {
        let session_key = resolve_session_key(None, ctx);
        let agent_id = resolve_agent_id(None, ctx);
        let tool_name = event
            .tool_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let parent = {
            let state = self.lock_state();
            state
                .store
                .get(&session_key)
                .map(|context| context.parent_context().clone())
        };
        if parent.is_none() {
            debug!(session_key = %session_key, tool = %tool_name, "No trace context for tool call");
        }

        let attributes = vec![
            KeyValue::new(attrs::OPERATION_NAME, GenAiOperation::ExecuteTool.as_str()),
            KeyValue::new(attrs::TOOL_NAME, tool_name.clone()),
            KeyValue::new(
                attrs::TOOL_CALL_ID,
                event.tool_call_id.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            ),
            KeyValue::new(attrs::TOOL_SYNTHETIC, event.is_synthetic),
            KeyValue::new(attrs::SESSION_ID, session_key.clone()),
            KeyValue::new(attrs::AGENT_ID, agent_id),
        ];
        let span = SpanHandle::start(
            self.backend.as_ref(),
            &GenAiOperation::ExecuteTool.span_name(&tool_name),
            SpanKind::Internal,
            attributes,
            parent.as_ref(),
        );

        let finding = self.security.inspect_tool_call(&tool_name, &event.params);
        if let Some(ref finding) = finding {
            span.set_attributes([
                KeyValue::new(attrs::SECURITY_DETECTED, true),
                KeyValue::new(attrs::SECURITY_CATEGORY, finding.category.clone()),
                KeyValue::new(attrs::SECURITY_SEVERITY, finding.severity.as_str()),
                KeyValue::new(
                    attrs::SECURITY_PREVIEW,
                    single_line_preview(&finding.preview, self.settings.max_security_preview_chars),
                ),
            ]);
            if finding.severity.is_error() {
                span.set_status(Status::error(format!(
                    "security: {}",
                    finding.category
                )));
            }
            self.metrics.increment(
                names::SECURITY_DETECTIONS,
                &[
                    KeyValue::new(labels::TOOL_NAME, tool_name.clone()),
                    KeyValue::new(labels::SEVERITY, finding.severity.as_str()),
                ],
            );
            warn!(
                tool = %tool_name,
                category = %finding.category,
                severity = finding.severity.as_str(),
                "Security detection on tool call"
            );
        }

        if let Some(size) = event
            .message
            .as_ref()
            .and_then(|message| content::result_size(&message.content))
        {
            span.set_attributes([
                KeyValue::new(attrs::TOOL_RESULT_CHARS, size.chars as i64),
                KeyValue::new(attrs::TOOL_RESULT_PARTS, size.parts as i64),
            ]);
        }

        let tool_status = if event.is_error() {
            span.set_status(Status::error("tool returned an error"));
            "error"
        } else if finding.is_some() {
            "flagged"
        } else {
            span.set_status(Status::Ok);
            "ok"
        };
        span.end();

        self.metrics.increment(
            names::TOOL_CALLS,
            &[
                KeyValue::new(labels::TOOL_NAME, tool_name),
                KeyValue::new(labels::TOOL_STATUS, tool_status),
            ],
        );
        Ok(())
    }

    fn turn_end(&self, event: &TurnEndEvent, ctx: &HookContext) -> Result<(), HookTraceError> {
        let session_key = resolve_session_key(None, ctx);
        let agent_id = resolve_agent_id(None, ctx);
        let now = Utc::now();

        let (context, diagnostic) = {
            let mut state = self.lock_state();
            let diagnostic = state.usage.finish_turn(&session_key);
            (state.store.delete(&session_key), diagnostic)
        };

        let messages = content::parse_transcript(&event.messages);
        let from_side_channel = diagnostic.is_some();
        let mut usage = diagnostic.unwrap_or_else(|| content::transcript_usage(&messages));
        if usage.model.is_none() {
            usage.model = context
                .as_ref()
                .and_then(|context| context.model().map(str::to_string));
        }

        let success = event.succeeded();
        let duration_ms = event.duration_ms.or(usage.duration_ms);

        let mut attributes = usage.span_attributes();
        attributes.push(KeyValue::new(attrs::TURN_SUCCESS, success));
        if let Some(duration) = duration_ms {
            attributes.push(KeyValue::new(attrs::TURN_DURATION_MS, duration as i64));
        }
        let error_message = (!success).then(|| {
            let (message, truncated) = truncate_checked(
                event.error.as_deref().unwrap_or("agent turn failed"),
                self.settings.max_error_chars,
            );
            if truncated {
                debug!(session_key = %session_key, "Turn error message truncated");
            }
            message
        });
        if let Some(ref message) = error_message {
            attributes.push(KeyValue::new(attrs::ERROR_MESSAGE, message.clone()));
        }
        if self.settings.capture_content {
            attributes.extend(self.content_attributes(&messages));
        }

        match context {
            Some(context) => {
                let distinct_root = context.has_distinct_root();
                let elapsed = context.age(now);
                let (root, agent) = context.into_spans();

                match agent {
                    Some(agent) => {
                        agent.set_attributes(attributes);
                        agent.set_status(match error_message {
                            Some(message) => Status::error(message),
                            None => Status::Ok,
                        });
                        agent.end();
                    }
                    None => warn!(session_key = %session_key, "Trace context had no agent span"),
                }

                if distinct_root {
                    root.set_attribute(KeyValue::new(
                        attrs::REQUEST_DURATION_MS,
                        elapsed.as_millis() as i64,
                    ));
                    root.end();
                }
            }
            None => {
                debug!(session_key = %session_key, "No trace context at turn end; recording metrics only")
            }
        }

        if !from_side_channel {
            record_usage_metrics(self.metrics.as_ref(), &usage);
        }

        let mut turn_labels = vec![KeyValue::new(labels::TURN_SUCCESS, success)];
        if let Some(ref model) = usage.model {
            turn_labels.push(KeyValue::new(labels::MODEL, model.clone()));
        }
        self.metrics.increment(names::TURNS, &turn_labels);
        if let Some(duration) = duration_ms {
            self.metrics
                .record_histogram(names::TURN_DURATION_MS, duration as f64, &turn_labels);
        }

        debug!(
            session_key = %session_key,
            agent_id = %agent_id,
            success,
            usage_source = usage.source.as_str(),
            total_tokens = usage.tokens.total_tokens(),
            "Agent turn span ended"
        );
        Ok(())
    }

    /// Prompt and completion attributes, truncated
    fn content_attributes(&self, messages: &[content::TranscriptMessage]) -> Vec<KeyValue> {
        let mut attributes = Vec::with_capacity(2);
        if let Some(prompt) = content::last_text_for_role(messages, "user") {
            attributes.push(KeyValue::new(
                attrs::PROMPT,
                truncate_string(&prompt, self.settings.max_content_chars),
            ));
        }
        if let Some(completion) = content::last_text_for_role(messages, "assistant") {
            attributes.push(KeyValue::new(
                attrs::COMPLETION,
                truncate_string(&completion, self.settings.max_content_chars),
            ));
        }
        attributes
    }

    fn message_received(
        &self,
        event: &MessageReceivedEvent,
        ctx: &HookContext,
    ) -> Result<(), HookTraceError> {
        let channel = ctx
            .channel_id
            .clone()
            .or_else(|| event.channel.clone())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let mut attributes = vec![
            KeyValue::new(attrs::CHANNEL, channel.clone()),
            KeyValue::new(
                attrs::MESSAGE_LENGTH,
                event
                    .content
                    .as_deref()
                    .map(|text| text.chars().count())
                    .unwrap_or(0) as i64,
            ),
        ];
        if let Some(ref from) = event.from {
            attributes.push(KeyValue::new(attrs::MESSAGE_FROM, from.clone()));
        }
        if let Some(ref session_key) = ctx.session_key {
            attributes.push(KeyValue::new(attrs::SESSION_ID, session_key.clone()));
        }

        // Audit record only; turn spans never hang off it.
        SpanHandle::start(
            self.backend.as_ref(),
            span_names::MESSAGE_RECEIVED,
            SpanKind::Server,
            attributes,
            None,
        )
        .end();

        self.metrics.increment(
            names::MESSAGES_RECEIVED,
            &[KeyValue::new(labels::CHANNEL, channel)],
        );
        Ok(())
    }

    fn session_event(
        &self,
        name: HookEventName,
        event: &SessionEvent,
        ctx: &HookContext,
    ) -> Result<(), HookTraceError> {
        let session_key = resolve_session_key(event.session_key.as_ref(), ctx);
        self.metrics.increment(
            names::SESSIONS,
            &[KeyValue::new(labels::SESSION_EVENT, name.as_str())],
        );
        debug!(
            event = %name,
            session_key = %session_key,
            session_id = event.session_id.as_deref().unwrap_or(UNKNOWN),
            "Session lifecycle event"
        );
        Ok(())
    }

    fn usage_record(
        &self,
        record: &UsageRecord,
        now: DateTime<Utc>,
    ) -> Result<UsageDisposition, HookTraceError> {
        let session_key = resolve_session_key(record.session_key.as_ref(), &HookContext::default());
        let snapshot = UsageSnapshot::from_record(record);
        record_usage_metrics(self.metrics.as_ref(), &snapshot);

        let disposition = self.lock_state().usage.accept(&session_key, snapshot, now);
        debug!(session_key = %session_key, ?disposition, "Diagnostic usage received");
        Ok(disposition)
    }

    fn close_contexts(&self, contexts: Vec<SessionTraceContext>, reason: CloseReason) -> usize {
        let closed = contexts.len();
        for context in contexts {
            StaleContextReaper::force_close(context, reason);
        }
        if closed > 0 {
            self.metrics.record_counter(
                names::CONTEXTS_REAPED,
                closed as u64,
                &[KeyValue::new(labels::REASON, reason.as_str())],
            );
        }
        closed
    }

    fn lock_state(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` behind the fault boundary
    fn guarded<T>(
        &self,
        handler: &str,
        f: impl FnOnce() -> Result<T, HookTraceError>,
    ) -> Option<T> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
            Err(HookTraceError::handler_fault(
                handler,
                panic_message(panic.as_ref()),
            ))
        });

        match outcome {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(
                    handler,
                    primitive = error.is_primitive_error(),
                    error = %error,
                    "Hook handler failed; telemetry for this event was dropped"
                );
                None
            }
        }
    }
}

impl fmt::Debug for HookRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events: Vec<&str> = self.handlers.keys().map(HookEventName::as_str).collect();
        events.sort_unstable();
        f.debug_struct("HookRouter")
            .field("settings", &self.settings)
            .field("backend", &self.backend)
            .field("reaper", &self.reaper)
            .field("events", &events)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decode a payload; a missing (null) payload decodes to the empty event
fn decode<T: DeserializeOwned + Default>(payload: Value) -> Result<T, HookTraceError> {
    if payload.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(payload)?)
}

fn dispatch_turn_start(
    router: &HookRouter,
    payload: Value,
    ctx: &HookContext,
) -> Result<(), HookTraceError> {
    router.turn_start(&decode(payload)?, ctx)
}

fn dispatch_tool_execution(
    router: &HookRouter,
    payload: Value,
    ctx: &HookContext,
) -> Result<(), HookTraceError> {
    router.tool_execution(&decode(payload)?, ctx)
}

fn dispatch_turn_end(
    router: &HookRouter,
    payload: Value,
    ctx: &HookContext,
) -> Result<(), HookTraceError> {
    router.turn_end(&decode(payload)?, ctx)
}

fn dispatch_message_received(
    router: &HookRouter,
    payload: Value,
    ctx: &HookContext,
) -> Result<(), HookTraceError> {
    router.message_received(&decode(payload)?, ctx)
}

fn dispatch_session_start(
    router: &HookRouter,
    payload: Value,
    ctx: &HookContext,
) -> Result<(), HookTraceError> {
    router.session_event(HookEventName::SessionStart, &decode(payload)?, ctx)
}

fn dispatch_session_end(
    router: &HookRouter,
    payload: Value,
    ctx: &HookContext,
) -> Result<(), HookTraceError> {
    router.session_event(HookEventName::SessionEnd, &decode(payload)?, ctx)
}
