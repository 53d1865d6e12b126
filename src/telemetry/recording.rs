//! In-process span and metric recording
//!
//! [`RecordingSpanBackend`] and [`RecordingMetrics`] keep every span and data
//! point in memory instead of exporting it. They back the test-suite and are
//! handy when debugging a host integration without a collector running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, Status, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue, Value};

use super::metrics::MetricsRecorder;
use super::{HookSpan, SpanBackend};

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn generate_trace_id() -> TraceId {
    TraceId::from_bytes(fastrand::u128(1..).to_be_bytes())
}

fn generate_span_id() -> SpanId {
    SpanId::from_bytes(fastrand::u64(1..).to_be_bytes())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A span as captured by [`RecordingSpanBackend`]
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    /// Operation name
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Trace and span identity
    pub span_context: SpanContext,
    /// Parent span ID (if this is a child span)
    pub parent_span_id: Option<SpanId>,
    /// Span attributes, last write wins
    pub attributes: HashMap<String, Value>,
    /// Span status
    pub status: Status,
    /// Start time in nanoseconds since Unix epoch
    pub start_time_unix_nano: u64,
    /// End time in nanoseconds since Unix epoch, once ended
    pub end_time_unix_nano: Option<u64>,
    /// How many times `end` reached the backend
    pub end_count: u32,
}

impl RecordedSpan {
    pub fn trace_id(&self) -> TraceId {
        self.span_context.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.span_context.span_id()
    }

    pub fn is_ended(&self) -> bool {
        self.end_count > 0
    }

    pub fn is_child_of(&self, parent: &RecordedSpan) -> bool {
        self.parent_span_id == Some(parent.span_id()) && self.trace_id() == parent.trace_id()
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Value::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key) {
            Some(Value::F64(v)) => Some(*v),
            Some(Value::I64(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key) {
            Some(Value::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_str(&self, key: &str) -> Option<String> {
        match self.attributes.get(key) {
            Some(Value::String(v)) => Some(v.as_str().to_string()),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, Status::Error { .. })
    }
}

/// Span backend that records everything in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingSpanBackend {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingSpanBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every span started so far, in start order
    pub fn spans(&self) -> Vec<RecordedSpan> {
        lock(&self.spans).clone()
    }

    pub fn spans_named(&self, name: &str) -> Vec<RecordedSpan> {
        lock(&self.spans)
            .iter()
            .filter(|span| span.name == name)
            .cloned()
            .collect()
    }

    /// Spans whose name starts with `prefix`
    pub fn spans_with_prefix(&self, prefix: &str) -> Vec<RecordedSpan> {
        lock(&self.spans)
            .iter()
            .filter(|span| span.name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Spans started but never ended
    pub fn open_spans(&self) -> Vec<RecordedSpan> {
        lock(&self.spans)
            .iter()
            .filter(|span| !span.is_ended())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.spans).clear();
    }
}

impl SpanBackend for RecordingSpanBackend {
    fn start_span(
        &self,
        name: &str,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: Option<&Context>,
    ) -> Box<dyn HookSpan> {
        let parent_span_context = parent
            .map(|cx| cx.span().span_context().clone())
            .filter(|sc| sc.is_valid());

        let (trace_id, parent_span_id) = match parent_span_context {
            Some(sc) => (sc.trace_id(), Some(sc.span_id())),
            None => (generate_trace_id(), None),
        };
        let span_context = SpanContext::new(
            trace_id,
            generate_span_id(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );

        let record = RecordedSpan {
            name: name.to_string(),
            kind,
            span_context: span_context.clone(),
            parent_span_id,
            attributes: attributes
                .into_iter()
                .map(|kv| (kv.key.as_str().to_string(), kv.value))
                .collect(),
            status: Status::Unset,
            start_time_unix_nano: now_nanos(),
            end_time_unix_nano: None,
            end_count: 0,
        };

        let index = {
            let mut spans = lock(&self.spans);
            spans.push(record);
            spans.len() - 1
        };

        Box::new(RecordingSpan {
            spans: Arc::clone(&self.spans),
            index,
            span_context,
        })
    }
}

/// Live span handed out by [`RecordingSpanBackend`]; writes go straight to
/// the shared record so snapshots always show current state
#[derive(Debug)]
struct RecordingSpan {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
    index: usize,
    span_context: SpanContext,
}

impl RecordingSpan {
    fn with_record(&self, f: impl FnOnce(&mut RecordedSpan)) {
        if let Some(record) = lock(&self.spans).get_mut(self.index) {
            f(record);
        }
    }
}

impl HookSpan for RecordingSpan {
    fn span_context(&self) -> SpanContext {
        self.span_context.clone()
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        self.with_record(|record| {
            record
                .attributes
                .insert(attribute.key.as_str().to_string(), attribute.value);
        });
    }

    fn set_status(&mut self, status: Status) {
        self.with_record(|record| record.status = status);
    }

    fn end(&mut self) {
        self.with_record(|record| {
            record.end_count += 1;
            record.end_time_unix_nano = Some(now_nanos());
        });
    }
}

/// Kind of recorded metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
}

/// One recorded data point
#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Vec<KeyValue>,
}

impl MetricPoint {
    pub fn label(&self, key: &str) -> Option<String> {
        self.labels
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.as_str().into_owned())
    }
}

/// Metrics recorder that keeps every data point in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingMetrics {
    points: Arc<Mutex<Vec<MetricPoint>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        lock(&self.points).clone()
    }

    pub fn points_named(&self, name: &str) -> Vec<MetricPoint> {
        lock(&self.points)
            .iter()
            .filter(|point| point.name == name)
            .cloned()
            .collect()
    }

    /// Sum of all values recorded under `name`
    pub fn total(&self, name: &str) -> f64 {
        self.points_named(name).iter().map(|p| p.value).sum()
    }

    /// Sum of values recorded under `name` whose label `key` equals `value`
    pub fn total_where(&self, name: &str, key: &str, value: &str) -> f64 {
        self.points_named(name)
            .iter()
            .filter(|p| p.label(key).as_deref() == Some(value))
            .map(|p| p.value)
            .sum()
    }

    pub fn clear(&self) {
        lock(&self.points).clear();
    }

    fn push(&self, name: &str, kind: MetricKind, value: f64, labels: &[KeyValue]) {
        lock(&self.points).push(MetricPoint {
            name: name.to_string(),
            kind,
            value,
            labels: labels.to_vec(),
        });
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn record_counter(&self, name: &str, value: u64, labels: &[KeyValue]) {
        self.push(name, MetricKind::Counter, value as f64, labels);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[KeyValue]) {
        self.push(name, MetricKind::Histogram, value, labels);
    }
}
