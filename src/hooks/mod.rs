//! Lifecycle hooks that turn host events into traces
//!
//! The host runs agent turns and calls into this module at fixed points:
//!
//! 1. `before_agent_start` opens a root request span for the session (if one
//!    is not already open) and an `invoke_agent` span beneath it.
//! 2. `tool_result_persist` records an `execute_tool` span under the agent
//!    span, ended immediately.
//! 3. `agent_end` attaches usage, ends the agent span and closes the root.
//!
//! Token usage also arrives on a diagnostic side channel, in no particular
//! order relative to these events. [`usage::UsageLedger`] reconciles the two
//! sources. Contexts whose turn never ends are closed by the
//! [`reaper::StaleContextReaper`].
//!
//! Trace state lives in [`store::SessionContextStore`], keyed by session key
//! and not by any ambient "current span", because tool and turn-end events
//! can arrive on a different call stack than turn start.

pub mod content;
pub mod events;
pub mod reaper;
pub mod router;
pub mod security;
pub mod store;
pub mod usage;

pub use events::{
    HookContext, HookEventName, MessageReceivedEvent, SessionEvent, ToolExecutionEvent,
    TurnEndEvent, TurnStartEvent, UsageRecord,
};
pub use reaper::{CloseReason, StaleContextReaper};
pub use router::{HookRouter, HookSettings};
pub use security::{NoSecurityCheck, SecurityCheck, SecurityFinding, Severity};
pub use store::{SessionContextStore, SessionTraceContext};
pub use usage::{UsageDisposition, UsageFeed, UsageLedger, UsageSnapshot, UsageSource};
