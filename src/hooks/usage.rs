//! Usage reconciliation
//!
//! Token and cost usage reaches the plugin two ways: as records on the
//! diagnostic side channel, and embedded in the `agent_end` transcript. The
//! two are not ordered relative to each other or to the lifecycle events.
//!
//! [`UsageLedger`] keeps the per-session state that lets either source land
//! on the right agent span:
//!
//! - a side table of live agent spans, published at turn start;
//! - pending records that arrived before the session's turn opened;
//! - the diagnostic usage already applied to the live span this turn;
//! - sessions whose turn has ended and not been followed by a new one.
//!
//! A record that arrives after its turn ended has nowhere to go: its metrics
//! are recorded on receipt and it is not buffered, so the next turn cannot
//! pick it up.
//!
//! Diagnostic data is authoritative. The transcript is only used when no
//! diagnostic record reached the turn, and only then are usage metrics
//! recorded at turn end, so each turn's usage is counted once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tracing::debug;

use super::events::{TokenUsage, UsageRecord};
use crate::telemetry::genai::attrs;
use crate::telemetry::metrics::{labels, names, MetricsRecorder};
use crate::telemetry::SpanHandle;

/// Token counts in the four categories plus an optional host-reported total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    /// Total as reported by the host, when every contributing record had one
    pub reported_total: Option<u64>,
}

impl UsageTotals {
    pub fn from_usage(usage: &TokenUsage) -> Self {
        let mut totals = Self {
            reported_total: Some(0),
            ..Default::default()
        };
        totals.add(usage);
        totals
    }

    /// Accumulate one more usage block
    pub fn add(&mut self, usage: &TokenUsage) {
        self.input_tokens += usage.input.unwrap_or(0);
        self.output_tokens += usage.output.unwrap_or(0);
        self.cache_read_tokens += usage.cache_read.unwrap_or(0);
        self.cache_write_tokens += usage.cache_write.unwrap_or(0);
        self.reported_total = match (self.reported_total, usage.total_tokens) {
            (Some(sum), Some(total)) => Some(sum + total),
            _ => None,
        };
    }

    /// Combine two totals
    pub fn merge(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.reported_total = match (self.reported_total, other.reported_total) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
    }

    /// Sum of the four categories
    pub fn summed_total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    /// Host-reported total when available, otherwise the sum
    pub fn total_tokens(&self) -> u64 {
        self.reported_total.unwrap_or_else(|| self.summed_total())
    }

    pub fn is_empty(&self) -> bool {
        self.summed_total() == 0 && self.reported_total.unwrap_or(0) == 0
    }
}

/// Where a usage snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSource {
    /// Diagnostic side channel
    Diagnostic,
    /// Turn transcript
    Transcript,
}

impl UsageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnostic => "diagnostic",
            Self::Transcript => "transcript",
        }
    }
}

/// Usage numbers ready to be attached to a span or recorded as metrics
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSnapshot {
    pub source: UsageSource,
    pub tokens: UsageTotals,
    pub cost_usd: Option<f64>,
    pub context_limit: Option<u64>,
    pub context_used: Option<u64>,
    pub duration_ms: Option<u64>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl UsageSnapshot {
    /// Snapshot of one diagnostic record
    pub fn from_record(record: &UsageRecord) -> Self {
        let context = record.context.clone().unwrap_or_default();
        Self {
            source: UsageSource::Diagnostic,
            tokens: record
                .usage
                .as_ref()
                .map(UsageTotals::from_usage)
                .unwrap_or_default(),
            cost_usd: record.cost_usd,
            context_limit: context.limit,
            context_used: context.used,
            duration_ms: record.duration_ms,
            provider: record.provider.clone(),
            model: record.model.clone(),
        }
    }

    /// Fold a later diagnostic record for the same turn into this one.
    /// Counts and costs add up; context window and model take the latest value.
    pub fn absorb(&mut self, later: &UsageSnapshot) {
        self.tokens.merge(&later.tokens);
        self.cost_usd = match (self.cost_usd, later.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.duration_ms = match (self.duration_ms, later.duration_ms) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        if later.context_limit.is_some() {
            self.context_limit = later.context_limit;
        }
        if later.context_used.is_some() {
            self.context_used = later.context_used;
        }
        if later.provider.is_some() {
            self.provider = later.provider.clone();
        }
        if later.model.is_some() {
            self.model = later.model.clone();
        }
    }

    /// Attributes for the agent span
    pub fn span_attributes(&self) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new(attrs::USAGE_INPUT_TOKENS, self.tokens.input_tokens as i64),
            KeyValue::new(attrs::USAGE_OUTPUT_TOKENS, self.tokens.output_tokens as i64),
            KeyValue::new(
                attrs::USAGE_CACHE_READ_TOKENS,
                self.tokens.cache_read_tokens as i64,
            ),
            KeyValue::new(
                attrs::USAGE_CACHE_WRITE_TOKENS,
                self.tokens.cache_write_tokens as i64,
            ),
            KeyValue::new(attrs::USAGE_TOTAL_TOKENS, self.tokens.total_tokens() as i64),
            KeyValue::new(attrs::USAGE_SOURCE, self.source.as_str()),
        ];
        if let Some(cost) = self.cost_usd {
            attributes.push(KeyValue::new(attrs::COST_USD, cost));
        }
        if let Some(limit) = self.context_limit {
            attributes.push(KeyValue::new(attrs::CONTEXT_LIMIT, limit as i64));
        }
        if let Some(used) = self.context_used {
            attributes.push(KeyValue::new(attrs::CONTEXT_USED, used as i64));
        }
        if let Some(ref model) = self.model {
            attributes.push(KeyValue::new(attrs::RESPONSE_MODEL, model.clone()));
        }
        if let Some(ref provider) = self.provider {
            attributes.push(KeyValue::new(attrs::PROVIDER_NAME, provider.clone()));
        }
        attributes
    }

    fn metric_labels(&self) -> Vec<KeyValue> {
        let mut metric_labels = Vec::with_capacity(2);
        if let Some(ref provider) = self.provider {
            metric_labels.push(KeyValue::new(labels::PROVIDER, provider.clone()));
        }
        if let Some(ref model) = self.model {
            metric_labels.push(KeyValue::new(labels::MODEL, model.clone()));
        }
        metric_labels
    }
}

/// Record token, cost and context-window metrics for one snapshot
pub fn record_usage_metrics(recorder: &dyn MetricsRecorder, snapshot: &UsageSnapshot) {
    let base = snapshot.metric_labels();
    let by_type = [
        ("input", snapshot.tokens.input_tokens),
        ("output", snapshot.tokens.output_tokens),
        ("cache_read", snapshot.tokens.cache_read_tokens),
        ("cache_write", snapshot.tokens.cache_write_tokens),
    ];
    for (token_type, count) in by_type {
        if count == 0 {
            continue;
        }
        let mut token_labels = base.clone();
        token_labels.push(KeyValue::new(labels::TOKEN_TYPE, token_type));
        recorder.record_counter(names::TOKENS, count, &token_labels);
    }

    if let Some(cost) = snapshot.cost_usd {
        recorder.record_histogram(names::COST_USD, cost, &base);
    }
    if let Some(used) = snapshot.context_used {
        let mut context_labels = base.clone();
        if let Some(limit) = snapshot.context_limit {
            context_labels.push(KeyValue::new(labels::CONTEXT_LIMIT, limit as i64));
        }
        recorder.record_histogram(names::CONTEXT_USED, used as f64, &context_labels);
    }
}

/// A usage record that arrived while no agent span was live
#[derive(Debug, Clone)]
pub struct PendingUsageRecord {
    pub snapshot: UsageSnapshot,
    pub received_at: DateTime<Utc>,
}

/// What happened to a side-channel record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDisposition {
    /// Attributes went straight onto the live agent span
    AttachedToLiveSpan,
    /// Buffered until the next turn end or live-span registration
    Pending,
    /// The session's turn already ended; counted as metrics only
    AfterTurnEnd,
}

#[derive(Debug)]
struct LiveTurn {
    span: SpanHandle,
    applied: Option<UsageSnapshot>,
}

impl LiveTurn {
    fn apply(&mut self, snapshot: UsageSnapshot) {
        match self.applied {
            Some(ref mut applied) => applied.absorb(&snapshot),
            None => self.applied = Some(snapshot),
        }
        if let Some(ref applied) = self.applied {
            self.span.set_attributes(applied.span_attributes());
        }
    }
}

/// Per-session reconciliation state
#[derive(Debug, Default)]
pub struct UsageLedger {
    live: HashMap<String, LiveTurn>,
    pending: HashMap<String, PendingUsageRecord>,
    finished: HashMap<String, DateTime<Utc>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the live agent span for `session_key`. A pending record for
    /// the session is consumed and attached right away; returns whether that
    /// happened.
    pub fn register_live_span(&mut self, session_key: &str, span: SpanHandle) -> bool {
        self.finished.remove(session_key);
        let mut turn = LiveTurn {
            span,
            applied: None,
        };
        let consumed = match self.pending.remove(session_key) {
            Some(pending) => {
                debug!(session_key, "Attaching pending usage to new agent span");
                turn.apply(pending.snapshot);
                true
            }
            None => false,
        };
        self.live.insert(session_key.to_string(), turn);
        consumed
    }

    /// Accept a side-channel record: attach it to the live span, buffer it
    /// for a turn that has not opened yet, or drop it when the session's last
    /// turn already ended
    pub fn accept(
        &mut self,
        session_key: &str,
        snapshot: UsageSnapshot,
        now: DateTime<Utc>,
    ) -> UsageDisposition {
        if let Some(turn) = self.live.get_mut(session_key) {
            if !turn.span.is_ended() {
                turn.apply(snapshot);
                return UsageDisposition::AttachedToLiveSpan;
            }
        }
        if self.finished.contains_key(session_key) {
            return UsageDisposition::AfterTurnEnd;
        }

        match self.pending.get_mut(session_key) {
            Some(pending) => {
                pending.snapshot.absorb(&snapshot);
                pending.received_at = now;
            }
            None => {
                self.pending.insert(
                    session_key.to_string(),
                    PendingUsageRecord {
                        snapshot,
                        received_at: now,
                    },
                );
            }
        }
        UsageDisposition::Pending
    }

    /// Close out a turn: drop the side-table entry and return the diagnostic
    /// usage that reached it, whether applied live or still pending
    pub fn finish_turn(&mut self, session_key: &str) -> Option<UsageSnapshot> {
        self.finished.insert(session_key.to_string(), Utc::now());
        let applied = self.live.remove(session_key).and_then(|turn| turn.applied);
        let pending = self
            .pending
            .remove(session_key)
            .map(|pending| pending.snapshot);

        match (applied, pending) {
            (Some(mut applied), Some(pending)) => {
                applied.absorb(&pending);
                Some(applied)
            }
            (applied, pending) => applied.or(pending),
        }
    }

    /// Forget the live turn without consuming anything (used for stale contexts)
    pub fn release(&mut self, session_key: &str) {
        self.live.remove(session_key);
    }

    /// Drop pending records older than `cutoff`; returns how many were dropped.
    /// Finished-turn markers older than `cutoff` are forgotten as well.
    pub fn expire_pending(&mut self, cutoff: DateTime<Utc>) -> usize {
        self.finished.retain(|_, ended_at| *ended_at >= cutoff);
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.received_at >= cutoff);
        before - self.pending.len()
    }

    pub fn has_live_span(&self, session_key: &str) -> bool {
        self.live.contains_key(session_key)
    }

    pub fn pending(&self, session_key: &str) -> Option<&PendingUsageRecord> {
        self.pending.get(session_key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.live.clear();
        self.pending.clear();
        self.finished.clear();
    }
}

/// Publish/subscribe channel for side-channel usage records
#[derive(Debug, Clone)]
pub struct UsageFeed {
    sender: broadcast::Sender<UsageRecord>,
}

impl UsageFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a record; returns the number of subscribers it reached
    pub fn publish(&self, record: UsageRecord) -> usize {
        self.sender.send(record).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UsageRecord> {
        self.sender.subscribe()
    }
}

impl Default for UsageFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{RecordingMetrics, RecordingSpanBackend};
    use opentelemetry::trace::SpanKind;

    fn record(input: u64, output: u64) -> UsageRecord {
        UsageRecord {
            session_key: Some("s1".to_string()),
            cost_usd: Some(0.5),
            usage: Some(TokenUsage {
                input: Some(input),
                output: Some(output),
                ..Default::default()
            }),
            model: Some("m".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_total_prefers_reported_value() {
        let totals = UsageTotals::from_usage(&TokenUsage {
            input: Some(10),
            output: Some(5),
            total_tokens: Some(20),
            ..Default::default()
        });
        assert_eq!(totals.summed_total(), 15);
        assert_eq!(totals.total_tokens(), 20);

        let mut partial = totals;
        partial.add(&TokenUsage {
            input: Some(1),
            ..Default::default()
        });
        // One block without a reported total: fall back to the sum
        assert_eq!(partial.reported_total, None);
        assert_eq!(partial.total_tokens(), 16);
    }

    #[test]
    fn test_pending_then_finish_turn() {
        let mut ledger = UsageLedger::new();
        let now = Utc::now();
        let disposition = ledger.accept("s1", UsageSnapshot::from_record(&record(7, 3)), now);
        assert_eq!(disposition, UsageDisposition::Pending);
        assert!(ledger.pending("s1").is_some());

        let snapshot = ledger.finish_turn("s1").unwrap();
        assert_eq!(snapshot.tokens.input_tokens, 7);
        assert_eq!(snapshot.source, UsageSource::Diagnostic);
        assert!(ledger.pending("s1").is_none());
        assert!(ledger.finish_turn("s1").is_none());
    }

    #[test]
    fn test_live_span_attach() {
        let backend = RecordingSpanBackend::new();
        let span = SpanHandle::start(&backend, "invoke_agent a1", SpanKind::Internal, vec![], None);
        let mut ledger = UsageLedger::new();
        assert!(!ledger.register_live_span("s1", span));

        let now = Utc::now();
        assert_eq!(
            ledger.accept("s1", UsageSnapshot::from_record(&record(7, 3)), now),
            UsageDisposition::AttachedToLiveSpan
        );
        assert_eq!(
            ledger.accept("s1", UsageSnapshot::from_record(&record(1, 1)), now),
            UsageDisposition::AttachedToLiveSpan
        );
        assert_eq!(ledger.pending_count(), 0);

        let recorded = &backend.spans()[0];
        assert_eq!(recorded.attr_i64(attrs::USAGE_INPUT_TOKENS), Some(8));
        assert_eq!(recorded.attr_i64(attrs::USAGE_OUTPUT_TOKENS), Some(4));
        assert_eq!(recorded.attr_f64(attrs::COST_USD), Some(1.0));

        let finished = ledger.finish_turn("s1").unwrap();
        assert_eq!(finished.tokens.input_tokens, 8);
        assert!(!ledger.has_live_span("s1"));
    }

    #[test]
    fn test_register_consumes_pending() {
        let backend = RecordingSpanBackend::new();
        let mut ledger = UsageLedger::new();
        ledger.accept("s1", UsageSnapshot::from_record(&record(4, 2)), Utc::now());

        let span = SpanHandle::start(&backend, "invoke_agent a1", SpanKind::Internal, vec![], None);
        assert!(ledger.register_live_span("s1", span));
        assert!(ledger.pending("s1").is_none());
        assert_eq!(
            backend.spans()[0].attr_str(attrs::USAGE_SOURCE).as_deref(),
            Some("diagnostic")
        );
    }

    #[test]
    fn test_usage_after_finished_turn_is_not_buffered() {
        let backend = RecordingSpanBackend::new();
        let mut ledger = UsageLedger::new();
        let span = SpanHandle::start(&backend, "invoke_agent a1", SpanKind::Internal, vec![], None);
        ledger.register_live_span("s1", span);
        assert!(ledger.finish_turn("s1").is_none());

        assert_eq!(
            ledger.accept("s1", UsageSnapshot::from_record(&record(10, 5)), Utc::now()),
            UsageDisposition::AfterTurnEnd
        );
        assert_eq!(ledger.pending_count(), 0);

        // The next turn starts clean
        let next = SpanHandle::start(&backend, "invoke_agent a1", SpanKind::Internal, vec![], None);
        assert!(!ledger.register_live_span("s1", next));
        assert!(ledger.finish_turn("s1").is_none());
    }

    #[test]
    fn test_expire_pending() {
        let mut ledger = UsageLedger::new();
        let old = Utc::now() - chrono::Duration::minutes(10);
        ledger.accept("old", UsageSnapshot::from_record(&record(1, 1)), old);
        ledger.accept("new", UsageSnapshot::from_record(&record(1, 1)), Utc::now());

        let dropped = ledger.expire_pending(Utc::now() - chrono::Duration::minutes(5));
        assert_eq!(dropped, 1);
        assert!(ledger.pending("new").is_some());
    }

    #[test]
    fn test_record_usage_metrics_skips_zero_counts() {
        let metrics = RecordingMetrics::new();
        record_usage_metrics(&metrics, &UsageSnapshot::from_record(&record(10, 0)));

        let tokens = metrics.points_named(names::TOKENS);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].label(labels::TOKEN_TYPE).as_deref(), Some("input"));
        assert_eq!(metrics.total(names::COST_USD), 0.5);
    }

    #[tokio::test]
    async fn test_usage_feed_delivers_to_subscribers() {
        let feed = UsageFeed::new(4);
        let mut receiver = feed.subscribe();
        assert_eq!(feed.publish(record(1, 2)), 1);
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.session_key.as_deref(), Some("s1"));
    }
}
