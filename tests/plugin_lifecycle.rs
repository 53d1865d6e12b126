//! Plugin lifecycle tests
//!
//! Exercise the background tasks the plugin owns: the stale-context reaper
//! running on its own interval, the diagnostic usage feed, and shutdown
//! force-closing whatever is still open.

use std::sync::Arc;
use std::time::Duration;

use hooktrace::config::{HookTraceConfig, ReaperConfig};
use hooktrace::hooks::events::TokenUsage;
use hooktrace::hooks::{HookContext, NoSecurityCheck, UsageFeed, UsageRecord};
use hooktrace::telemetry::genai::{attrs, span_names};
use hooktrace::telemetry::metrics::names;
use hooktrace::telemetry::{RecordingMetrics, RecordingSpanBackend};
use hooktrace::TracePlugin;
use serde_json::{json, Value};

fn plugin_with(
    config: HookTraceConfig,
) -> (TracePlugin, RecordingSpanBackend, RecordingMetrics) {
    let backend = RecordingSpanBackend::new();
    let metrics = RecordingMetrics::new();
    let plugin = TracePlugin::new(
        config,
        Arc::new(backend.clone()),
        Arc::new(metrics.clone()),
        Arc::new(NoSecurityCheck),
    )
    .expect("valid config");
    (plugin, backend, metrics)
}

/// Poll `check` until it holds or a second passes
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// The reaper task closes abandoned turns on its own
#[tokio::test]
async fn test_reaper_task_closes_abandoned_turn() {
    let config = HookTraceConfig {
        reaper: ReaperConfig {
            sweep_interval: Duration::from_millis(20),
            stale_after: Duration::from_millis(10),
        },
        ..Default::default()
    };
    let (plugin, backend, metrics) = plugin_with(config);
    let ctx = HookContext::for_session("s1").with_agent("a1");

    plugin.handle_event("gateway_start", Value::Null, &ctx).await;
    plugin
        .handle_event("before_agent_start", json!({ "model": "m" }), &ctx)
        .await;
    assert!(plugin.router().has_context("s1"));

    let router = Arc::clone(plugin.router());
    assert!(eventually(|| !router.has_context("s1")).await);

    assert!(backend.open_spans().is_empty());
    let root = &backend.spans_named(span_names::REQUEST)[0];
    assert_eq!(root.attr_str(attrs::FORCE_CLOSED).as_deref(), Some("stale"));
    assert_eq!(metrics.total(names::CONTEXTS_REAPED), 1.0);

    plugin.handle_event("gateway_stop", Value::Null, &ctx).await;
    assert!(!plugin.is_running());
}

/// Usage records published on the feed land on the live agent span
#[tokio::test]
async fn test_usage_feed_attaches_to_live_span() {
    let (plugin, backend, metrics) = plugin_with(HookTraceConfig::default());
    let feed = UsageFeed::new(16);
    plugin.start().unwrap();
    plugin.attach_usage_feed(feed.subscribe());

    let ctx = HookContext::for_session("s1").with_agent("a1");
    plugin
        .handle_event("before_agent_start", json!({ "model": "m" }), &ctx)
        .await;

    feed.publish(UsageRecord {
        session_key: Some("s1".to_string()),
        usage: Some(TokenUsage {
            input: Some(120),
            output: Some(30),
            ..Default::default()
        }),
        ..Default::default()
    });
    assert!(eventually(|| metrics.total(names::TOKENS) == 150.0).await);

    plugin
        .handle_event(
            "agent_end",
            json!({ "messages": [{ "role": "assistant", "content": "ok",
                                   "usage": { "input": 1, "output": 1 } }] }),
            &ctx,
        )
        .await;

    let agent = &backend.spans_named("invoke_agent a1")[0];
    assert_eq!(agent.attr_i64(attrs::USAGE_INPUT_TOKENS), Some(120));
    assert_eq!(agent.attr_str(attrs::USAGE_SOURCE).as_deref(), Some("diagnostic"));
    // Transcript usage is not recorded on top of the side-channel numbers
    assert_eq!(metrics.total(names::TOKENS), 150.0);

    plugin.stop().await;
}

/// Stopping closes every turn still in flight
#[tokio::test]
async fn test_stop_force_closes_open_turns() {
    let (plugin, backend, _) = plugin_with(HookTraceConfig::default());
    plugin.start().unwrap();

    for session in ["s1", "s2", "s3"] {
        let ctx = HookContext::for_session(session).with_agent("a1");
        plugin.handle_event("before_agent_start", Value::Null, &ctx).await;
    }
    assert_eq!(plugin.router().active_sessions(), 3);

    assert_eq!(plugin.stop().await, 3);
    assert_eq!(plugin.router().active_sessions(), 0);
    assert!(backend.open_spans().is_empty());
    for span in backend.spans() {
        assert_eq!(span.end_count, 1);
        assert_eq!(
            span.attr_str(attrs::FORCE_CLOSED).as_deref(),
            Some("shutdown")
        );
    }
}

/// Unknown events pass through without touching any state
#[tokio::test]
async fn test_unknown_events_are_ignored() {
    let (plugin, backend, metrics) = plugin_with(HookTraceConfig::default());
    let ctx = HookContext::for_session("s1");

    plugin
        .handle_event("llm_output", json!({ "text": "hi" }), &ctx)
        .await;
    plugin
        .handle_event("before_tool_call", json!({ "toolName": "exec" }), &ctx)
        .await;

    assert!(backend.spans().is_empty());
    assert!(metrics.points().is_empty());
}
