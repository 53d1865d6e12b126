//! Lifecycle event names and payloads
//!
//! Payloads arrive as JSON from the host. Every field is optional and
//! defaults to "absent" so that a partially filled payload still produces
//! telemetry instead of an error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::HookTraceError;

/// Placeholder for identifiers an event did not carry
pub const UNKNOWN: &str = "unknown";

/// Lifecycle events the router understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEventName {
    /// An inbound message reached a channel (audit only)
    MessageReceived,
    /// An agent-processing turn is about to start
    BeforeAgentStart,
    /// A tool call finished and its result is about to be persisted
    ToolResultPersist,
    /// An agent-processing turn finished
    AgentEnd,
    SessionStart,
    SessionEnd,
    GatewayStart,
    GatewayStop,
}

impl HookEventName {
    pub const ALL: [HookEventName; 8] = [
        HookEventName::MessageReceived,
        HookEventName::BeforeAgentStart,
        HookEventName::ToolResultPersist,
        HookEventName::AgentEnd,
        HookEventName::SessionStart,
        HookEventName::SessionEnd,
        HookEventName::GatewayStart,
        HookEventName::GatewayStop,
    ];

    /// Name as registered with the host
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::BeforeAgentStart => "before_agent_start",
            Self::ToolResultPersist => "tool_result_persist",
            Self::AgentEnd => "agent_end",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::GatewayStart => "gateway_start",
            Self::GatewayStop => "gateway_stop",
        }
    }

    /// Whether the host awaits this handler. Synchronous handlers must not
    /// suspend; span creation and parenting happen inside them.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Self::AgentEnd | Self::GatewayStart | Self::GatewayStop
        )
    }
}

impl fmt::Display for HookEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HookEventName {
    type Err = HookTraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| HookTraceError::invalid_payload(format!("unknown hook event '{}'", s)))
    }
}

/// Context object passed alongside every event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookContext {
    pub session_key: Option<String>,
    pub agent_id: Option<String>,
    pub channel_id: Option<String>,
    pub message_provider: Option<String>,
}

impl HookContext {
    pub fn for_session(session_key: impl Into<String>) -> Self {
        Self {
            session_key: Some(session_key.into()),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.is_empty())
}

/// Session key: explicit event field, then context, then `"unknown"`
pub fn resolve_session_key(event_key: Option<&String>, ctx: &HookContext) -> String {
    non_empty(event_key)
        .or_else(|| non_empty(ctx.session_key.as_ref()))
        .unwrap_or(UNKNOWN)
        .to_string()
}

/// Agent id: context, then explicit event field, then `"unknown"`
pub fn resolve_agent_id(event_agent: Option<&String>, ctx: &HookContext) -> String {
    non_empty(ctx.agent_id.as_ref())
        .or_else(|| non_empty(event_agent))
        .unwrap_or(UNKNOWN)
        .to_string()
}

/// Payload of `before_agent_start`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnStartEvent {
    pub session_key: Option<String>,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    /// System prompt as seen by the host. Read only; never modified.
    pub prompt: Option<String>,
}

/// Tool result message carried by `tool_result_persist`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolResultMessage {
    /// Plain string or array of typed parts
    pub content: Value,
    pub is_error: bool,
}

/// Payload of `tool_result_persist`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolExecutionEvent {
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub is_synthetic: bool,
    /// Tool input as sent by the model
    pub params: Value,
    pub message: Option<ToolResultMessage>,
}

impl ToolExecutionEvent {
    pub fn is_error(&self) -> bool {
        self.message.as_ref().map(|m| m.is_error).unwrap_or(false)
    }
}

/// Payload of `agent_end`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnEndEvent {
    pub success: Option<bool>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    /// Transcript of the turn. Kept as raw JSON so one malformed message
    /// does not discard the rest.
    pub messages: Vec<Value>,
}

impl TurnEndEvent {
    /// Explicit flag if present, otherwise success means "no error reported"
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or(self.error.is_none())
    }
}

/// Payload of `message_received`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageReceivedEvent {
    pub from: Option<String>,
    pub content: Option<String>,
    pub channel: Option<String>,
    pub timestamp: Option<i64>,
}

/// Payload of `session_start` / `session_end`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionEvent {
    pub session_id: Option<String>,
    pub session_key: Option<String>,
}

/// Token counts as reported by the host. Field names follow the host's
/// wire format; `total` is accepted as an alias of `totalTokens`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub cache_read: Option<u64>,
    pub cache_write: Option<u64>,
    #[serde(alias = "total")]
    pub total_tokens: Option<u64>,
    pub cost: Option<UsageCost>,
}

/// Cost block attached to transcript usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCost {
    pub total: Option<f64>,
}

/// Context window occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextWindow {
    pub limit: Option<u64>,
    pub used: Option<u64>,
}

/// One usage record from the diagnostic side channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageRecord {
    pub session_key: Option<String>,
    pub cost_usd: Option<f64>,
    pub usage: Option<TokenUsage>,
    pub context: Option<ContextWindow>,
    pub duration_ms: Option<u64>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names_round_trip() {
        for name in HookEventName::ALL {
            assert_eq!(name.as_str().parse::<HookEventName>().unwrap(), name);
        }
        assert!("llm_output".parse::<HookEventName>().is_err());
    }

    #[test]
    fn test_async_events() {
        assert!(HookEventName::AgentEnd.is_async());
        assert!(!HookEventName::BeforeAgentStart.is_async());
        assert!(!HookEventName::ToolResultPersist.is_async());
    }

    #[test]
    fn test_session_key_fallback_chain() {
        let ctx = HookContext::for_session("ctx-key");
        assert_eq!(
            resolve_session_key(Some(&"event-key".to_string()), &ctx),
            "event-key"
        );
        assert_eq!(resolve_session_key(None, &ctx), "ctx-key");
        assert_eq!(resolve_session_key(Some(&String::new()), &ctx), "ctx-key");
        assert_eq!(resolve_session_key(None, &HookContext::default()), UNKNOWN);
    }

    #[test]
    fn test_agent_id_prefers_context() {
        let ctx = HookContext::default().with_agent("ctx-agent");
        assert_eq!(
            resolve_agent_id(Some(&"event-agent".to_string()), &ctx),
            "ctx-agent"
        );
        assert_eq!(
            resolve_agent_id(Some(&"event-agent".to_string()), &HookContext::default()),
            "event-agent"
        );
        assert_eq!(resolve_agent_id(None, &HookContext::default()), UNKNOWN);
    }

    #[test]
    fn test_partial_payloads_decode() {
        let event: TurnEndEvent = serde_json::from_value(json!({ "error": "boom" })).unwrap();
        assert!(!event.succeeded());
        assert!(event.messages.is_empty());

        let event: TurnEndEvent = serde_json::from_value(json!({})).unwrap();
        assert!(event.succeeded());

        let event: ToolExecutionEvent = serde_json::from_value(json!({
            "toolName": "exec",
            "message": { "content": [{ "type": "text", "text": "oops" }], "isError": true }
        }))
        .unwrap();
        assert!(event.is_error());
        assert_eq!(event.tool_name.as_deref(), Some("exec"));
    }

    #[test]
    fn test_usage_record_wire_format() {
        let record: UsageRecord = serde_json::from_value(json!({
            "sessionKey": "s1",
            "costUsd": 0.02,
            "usage": { "input": 100, "output": 20, "cacheRead": 5, "total": 125 },
            "context": { "limit": 200000, "used": 1200 },
            "provider": "anthropic",
            "model": "claude"
        }))
        .unwrap();

        let usage = record.usage.unwrap();
        assert_eq!(usage.input, Some(100));
        assert_eq!(usage.cache_read, Some(5));
        assert_eq!(usage.total_tokens, Some(125));
        assert_eq!(record.context.unwrap().used, Some(1200));
    }
}
