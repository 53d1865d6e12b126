//! Span names and attribute keys
//!
//! Agent and tool spans follow the OpenTelemetry GenAI semantic conventions
//! (<https://opentelemetry.io/docs/specs/semconv/gen-ai/>): span names are
//! `{operation} {target}` and usage lands under `gen_ai.usage.*`. Gateway
//! specific data (cost, context window, tool result size, security findings)
//! uses the `openclaw.*` namespace.

/// GenAI operation types emitted by the hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenAiOperation {
    /// One agent-processing turn (e.g., "invoke_agent main")
    InvokeAgent,
    /// One tool call (e.g., "execute_tool Read")
    ExecuteTool,
}

impl GenAiOperation {
    /// Get OTEL-compliant operation name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvokeAgent => "invoke_agent",
            Self::ExecuteTool => "execute_tool",
        }
    }

    /// Generate span name following OTEL convention: "{operation} {target}"
    pub fn span_name(&self, target: &str) -> String {
        format!("{} {}", self.as_str(), target)
    }
}

impl std::fmt::Display for GenAiOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Names of spans that are not GenAI operations
pub mod span_names {
    /// Root span covering an inbound request through the final reply
    pub const REQUEST: &str = "openclaw.request";
    /// Audit span for an inbound message
    pub const MESSAGE_RECEIVED: &str = "openclaw.message.received";
}

/// Attribute keys
pub mod attrs {
    // ========================================================================
    // GenAI core
    // ========================================================================

    pub const OPERATION_NAME: &str = "gen_ai.operation.name";
    pub const PROVIDER_NAME: &str = "gen_ai.provider.name";
    pub const REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const RESPONSE_MODEL: &str = "gen_ai.response.model";
    pub const AGENT_ID: &str = "gen_ai.agent.id";

    // ========================================================================
    // Usage
    // ========================================================================

    pub const USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const USAGE_CACHE_READ_TOKENS: &str = "gen_ai.usage.cache_read_input_tokens";
    pub const USAGE_CACHE_WRITE_TOKENS: &str = "gen_ai.usage.cache_creation_input_tokens";
    pub const USAGE_TOTAL_TOKENS: &str = "gen_ai.usage.total_tokens";

    /// Captured prompt text (content capture only)
    pub const PROMPT: &str = "gen_ai.prompt";
    /// Captured completion text (content capture only)
    pub const COMPLETION: &str = "gen_ai.completion";

    // ========================================================================
    // Tool
    // ========================================================================

    pub const TOOL_NAME: &str = "gen_ai.tool.name";
    pub const TOOL_CALL_ID: &str = "gen_ai.tool.call.id";

    // ========================================================================
    // Session
    // ========================================================================

    /// Session key as reported by the event that created the span
    pub const SESSION_ID: &str = "session.id";

    pub const ERROR_MESSAGE: &str = "error.message";

    // ========================================================================
    // Gateway specific
    // ========================================================================

    pub const CHANNEL: &str = "openclaw.channel";
    pub const REQUEST_DURATION_MS: &str = "openclaw.request.duration_ms";
    pub const COST_USD: &str = "openclaw.cost.usd";
    pub const CONTEXT_LIMIT: &str = "openclaw.context.limit";
    pub const CONTEXT_USED: &str = "openclaw.context.used";
    pub const TURN_DURATION_MS: &str = "openclaw.turn.duration_ms";
    pub const TURN_SUCCESS: &str = "openclaw.turn.success";
    /// Where usage numbers came from: `diagnostic` or `transcript`
    pub const USAGE_SOURCE: &str = "openclaw.usage.source";
    pub const TOOL_SYNTHETIC: &str = "openclaw.tool.synthetic";
    pub const TOOL_RESULT_CHARS: &str = "openclaw.tool.result.chars";
    pub const TOOL_RESULT_PARTS: &str = "openclaw.tool.result.parts";
    pub const SECURITY_DETECTED: &str = "openclaw.security.detected";
    pub const SECURITY_CATEGORY: &str = "openclaw.security.category";
    pub const SECURITY_SEVERITY: &str = "openclaw.security.severity";
    pub const SECURITY_PREVIEW: &str = "openclaw.security.preview";
    pub const MESSAGE_FROM: &str = "openclaw.message.from";
    pub const MESSAGE_LENGTH: &str = "openclaw.message.length";
    /// Set on spans closed by the reaper instead of their terminal event
    pub const FORCE_CLOSED: &str = "openclaw.force_closed";
}
