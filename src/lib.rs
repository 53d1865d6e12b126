//! Stitch agent gateway lifecycle hooks into distributed traces.
//!
//! An agent gateway reports what it does through independent callbacks: a
//! turn starts, tools run, the turn ends, and token usage shows up on a
//! separate diagnostic channel. None of these callbacks share a call stack,
//! so an ambient "current span" cannot link them. hooktrace keeps explicit
//! per-session trace state instead and produces one trace per request:
//!
//! ```text
//! openclaw.request                 (server, root)
//! └── invoke_agent {agent}         (one per turn)
//!     ├── execute_tool {tool}
//!     └── execute_tool {tool}
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hooktrace::config::HookTraceConfig;
//! use hooktrace::hooks::{HookContext, NoSecurityCheck};
//! use hooktrace::telemetry::logging::{init_logging, LoggingConfig};
//! use hooktrace::TracePlugin;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let _log_guard = init_logging(&LoggingConfig::from_env())?;
//!     let config = HookTraceConfig::from_env()?;
//!     let plugin = TracePlugin::with_defaults(config, Arc::new(NoSecurityCheck))?;
//!
//!     let ctx = HookContext::for_session("agent:main:telegram:42").with_agent("main");
//!     plugin.handle_event("gateway_start", json!(null), &ctx).await;
//!     plugin.handle_event("before_agent_start", json!({ "model": "claude" }), &ctx).await;
//!     plugin
//!         .handle_event("tool_result_persist", json!({ "toolName": "Read" }), &ctx)
//!         .await;
//!     plugin.handle_event("agent_end", json!({ "success": true }), &ctx).await;
//!     plugin.handle_event("gateway_stop", json!(null), &ctx).await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`hooks`] - event payloads, the session store, usage reconciliation and the router
//! - [`telemetry`] - span and metric primitives, OpenTelemetry wiring, logging setup
//! - [`plugin`] - background tasks and the gateway start/stop lifecycle
//! - [`config`] - settings from files and environment variables

pub mod config;
pub mod error;
pub mod hooks;
pub mod plugin;
pub mod telemetry;
pub mod utils;

pub use error::HookTraceError;
pub use hooks::{HookContext, HookEventName, HookRouter};
pub use plugin::TracePlugin;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, HookTraceError>;
