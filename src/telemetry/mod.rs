//! Telemetry primitives used by the lifecycle hooks
//!
//! The hook logic never talks to an exporter directly. It needs two
//! capabilities, and each one is a trait so the backing implementation can be
//! swapped:
//!
//! - [`SpanBackend`] starts spans with a name, kind, attributes and an
//!   optional parent [`Context`]. The returned [`HookSpan`] accepts
//!   attributes and a status and is ended explicitly.
//! - [`metrics::MetricsRecorder`] records counters and histograms.
//!
//! [`otel`] wires both to the OpenTelemetry SDK. [`recording`] keeps
//! everything in memory, which is what the tests use.
//!
//! Propagation contexts are plain [`opentelemetry::Context`] values. The core
//! only stores and hands them back as parents; it never inspects them.

pub mod genai;
pub mod logging;
pub mod metrics;
pub mod otel;
pub mod recording;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use opentelemetry::trace::{SpanContext, SpanKind, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};

pub use metrics::{MetricsRecorder, NoOpMetricsRecorder, SharedMetricsRecorder};
pub use otel::{OtelMetricsRecorder, OtelSpanBackend, TelemetryPipeline};
pub use recording::{RecordedSpan, RecordingMetrics, RecordingSpanBackend};

/// Creates spans. Implementations must be cheap to call from synchronous
/// handler code.
pub trait SpanBackend: Send + Sync + fmt::Debug {
    /// Start a span. `parent == None` starts a new trace.
    fn start_span(
        &self,
        name: &str,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: Option<&Context>,
    ) -> Box<dyn HookSpan>;
}

/// A started span as seen by the hook logic
pub trait HookSpan: Send + Sync + fmt::Debug {
    /// Identity of this span, used to build child propagation contexts
    fn span_context(&self) -> SpanContext;

    /// Set or overwrite one attribute
    fn set_attribute(&mut self, attribute: KeyValue);

    /// Set the span status
    fn set_status(&mut self, status: Status);

    /// End the span
    fn end(&mut self);
}

/// Shared backend handle
pub type SharedSpanBackend = Arc<dyn SpanBackend>;

struct SpanSlot {
    span: Box<dyn HookSpan>,
    ended: bool,
}

/// Cloneable handle to a started span
///
/// The session store owns the handle; the usage side table holds a clone of
/// the live agent span. All clones point at the same span, and `end` reaches
/// the backend at most once no matter how many clones call it.
#[derive(Clone)]
pub struct SpanHandle {
    slot: Arc<Mutex<SpanSlot>>,
    context: Context,
}

impl SpanHandle {
    /// Start a span on `backend` and wrap it
    pub fn start(
        backend: &dyn SpanBackend,
        name: &str,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: Option<&Context>,
    ) -> Self {
        Self::from_span(backend.start_span(name, kind, attributes, parent))
    }

    /// Wrap an already started span
    ///
    /// The context stores the span's own [`SpanContext`] unchanged, so its
    /// `is_remote` flag stays `false` for spans started in this process and
    /// parent-based samplers treat children as having a local parent.
    pub fn from_span(span: Box<dyn HookSpan>) -> Self {
        let context = Context::new().with_remote_span_context(span.span_context());
        Self {
            slot: Arc::new(Mutex::new(SpanSlot { span, ended: false })),
            context,
        }
    }

    /// Propagation context that makes new spans children of this one
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Identity of the wrapped span
    pub fn span_context(&self) -> SpanContext {
        self.context.span().span_context().clone()
    }

    /// Whether two handles refer to the same underlying span
    pub fn same_span(&self, other: &SpanHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Set one attribute. Ignored once the span has ended.
    pub fn set_attribute(&self, attribute: KeyValue) {
        let mut slot = self.lock();
        if !slot.ended {
            slot.span.set_attribute(attribute);
        }
    }

    /// Set several attributes. Ignored once the span has ended.
    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = KeyValue>) {
        let mut slot = self.lock();
        if !slot.ended {
            for attribute in attributes {
                slot.span.set_attribute(attribute);
            }
        }
    }

    /// Set the status. Ignored once the span has ended.
    pub fn set_status(&self, status: Status) {
        let mut slot = self.lock();
        if !slot.ended {
            slot.span.set_status(status);
        }
    }

    /// End the span. Returns `false` if it had already been ended.
    pub fn end(&self) -> bool {
        let mut slot = self.lock();
        if slot.ended {
            return false;
        }
        slot.ended = true;
        slot.span.end();
        true
    }

    /// Whether `end` has been called on any clone
    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    fn lock(&self) -> MutexGuard<'_, SpanSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let span_context = self.span_context();
        f.debug_struct("SpanHandle")
            .field("trace_id", &span_context.trace_id())
            .field("span_id", &span_context.span_id())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ends_once_across_clones() {
        let backend = RecordingSpanBackend::new();
        let handle = SpanHandle::start(&backend, "root", SpanKind::Server, vec![], None);
        let clone = handle.clone();

        assert!(handle.same_span(&clone));
        assert!(clone.end());
        assert!(!handle.end());
        assert!(handle.is_ended());

        let spans = backend.spans_named("root");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end_count, 1);
    }

    #[test]
    fn test_attributes_after_end_are_dropped() {
        let backend = RecordingSpanBackend::new();
        let handle = SpanHandle::start(&backend, "tool", SpanKind::Internal, vec![], None);
        handle.set_attribute(KeyValue::new("before", 1_i64));
        handle.end();
        handle.set_attribute(KeyValue::new("after", 2_i64));
        handle.set_status(Status::error("late"));

        let span = &backend.spans_named("tool")[0];
        assert!(span.attribute("before").is_some());
        assert!(span.attribute("after").is_none());
        assert_eq!(span.status, Status::Unset);
    }

    #[test]
    fn test_parent_context_stays_local() {
        let backend = RecordingSpanBackend::new();
        let parent = SpanHandle::start(&backend, "parent", SpanKind::Server, vec![], None);

        assert!(parent.context().has_active_span());
        assert!(!parent.context().span().span_context().is_remote());
        assert!(!parent.span_context().is_remote());
    }

    #[test]
    fn test_child_context_links_to_parent() {
        let backend = RecordingSpanBackend::new();
        let parent = SpanHandle::start(&backend, "parent", SpanKind::Server, vec![], None);
        let child = SpanHandle::start(
            &backend,
            "child",
            SpanKind::Internal,
            vec![],
            Some(parent.context()),
        );

        assert_eq!(
            child.span_context().trace_id(),
            parent.span_context().trace_id()
        );
        let recorded = &backend.spans_named("child")[0];
        assert_eq!(
            recorded.parent_span_id,
            Some(parent.span_context().span_id())
        );
    }
}
