//! Session Context Store
//!
//! Maps a session key to the trace state of the turn in flight for that
//! session: the root request span, the current agent span and when the
//! context was created. Entries exist from turn start until turn end or until
//! the reaper force-closes them.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::Context;

use crate::telemetry::SpanHandle;

/// In-flight trace state for one session
#[derive(Debug)]
pub struct SessionTraceContext {
    session_key: String,
    root: SpanHandle,
    agent: Option<SpanHandle>,
    start_time: DateTime<Utc>,
    /// Model declared by the latest turn start
    model: Option<String>,
    turns: u32,
}

impl SessionTraceContext {
    pub fn new(session_key: impl Into<String>, root: SpanHandle, start_time: DateTime<Utc>) -> Self {
        Self {
            session_key: session_key.into(),
            root,
            agent: None,
            start_time,
            model: None,
            turns: 0,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn root(&self) -> &SpanHandle {
        &self.root
    }

    pub fn root_context(&self) -> &Context {
        self.root.context()
    }

    pub fn agent(&self) -> Option<&SpanHandle> {
        self.agent.as_ref()
    }

    pub fn agent_context(&self) -> Option<&Context> {
        self.agent.as_ref().map(SpanHandle::context)
    }

    /// Parent for spans created inside the turn: the agent span when there
    /// is one, otherwise the root
    pub fn parent_context(&self) -> &Context {
        self.agent_context().unwrap_or_else(|| self.root_context())
    }

    /// Install the agent span for a new turn, returning the one it replaces
    pub fn replace_agent(&mut self, agent: SpanHandle, model: Option<String>) -> Option<SpanHandle> {
        self.turns += 1;
        self.model = model;
        self.agent.replace(agent)
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Number of turns started against this root
    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Wall time since creation; zero if the clock went backwards
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.start_time).to_std().unwrap_or_default()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }

    /// Whether the root and agent are separate spans
    pub fn has_distinct_root(&self) -> bool {
        match self.agent {
            Some(ref agent) => !agent.same_span(&self.root),
            None => true,
        }
    }

    /// Split into root and agent handles
    pub fn into_spans(self) -> (SpanHandle, Option<SpanHandle>) {
        (self.root, self.agent)
    }
}

/// Session key to trace context mapping
///
/// Not synchronised itself; the router serialises access.
#[derive(Debug, Default)]
pub struct SessionContextStore {
    contexts: HashMap<String, SessionTraceContext>,
}

impl SessionContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_key: &str) -> Option<&SessionTraceContext> {
        self.contexts.get(session_key)
    }

    pub fn get_mut(&mut self, session_key: &str) -> Option<&mut SessionTraceContext> {
        self.contexts.get_mut(session_key)
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.contexts.contains_key(session_key)
    }

    /// Store a context, returning any context previously held for the key
    pub fn put(&mut self, ctx: SessionTraceContext) -> Option<SessionTraceContext> {
        self.contexts.insert(ctx.session_key.clone(), ctx)
    }

    pub fn delete(&mut self, session_key: &str) -> Option<SessionTraceContext> {
        self.contexts.remove(session_key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &SessionTraceContext)> {
        self.contexts.iter()
    }

    /// Keys of contexts older than `threshold`
    pub fn stale_keys(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        self.entries()
            .filter(|(_, ctx)| ctx.is_stale(now, threshold))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Remove and return every context
    pub fn drain(&mut self) -> Vec<SessionTraceContext> {
        self.contexts.drain().map(|(_, ctx)| ctx).collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
