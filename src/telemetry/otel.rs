//! OpenTelemetry backed span and metrics primitives
//!
//! [`OtelSpanBackend`] and [`OtelMetricsRecorder`] go through the global
//! OpenTelemetry providers. [`init_pipeline`] installs those providers with
//! OTLP (and optionally stdout) exporters. A host that already configures
//! OpenTelemetry itself can skip the pipeline and use the backends directly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    trace::{Span, SpanContext, SpanKind, Status, Tracer},
    Context, KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{
        reader::{DefaultAggregationSelector, DefaultTemporalitySelector},
        PeriodicReader, SdkMeterProvider,
    },
    trace::{BatchSpanProcessor, TracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{
    SERVICE_INSTANCE_ID, SERVICE_NAME, SERVICE_VERSION,
};
use tracing::{debug, info, warn};

use super::metrics::{names, MetricsRecorder};
use super::{HookSpan, SpanBackend};
use crate::config::TelemetrySettings;
use crate::HookTraceError;

/// Instrumentation scope used for tracer and meter lookups
pub const INSTRUMENTATION_NAME: &str = "hooktrace";

/// Span backend that delegates to the global OpenTelemetry tracer
#[derive(Debug, Clone)]
pub struct OtelSpanBackend {
    tracer_name: &'static str,
}

impl OtelSpanBackend {
    pub fn new() -> Self {
        Self {
            tracer_name: INSTRUMENTATION_NAME,
        }
    }
}

impl Default for OtelSpanBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanBackend for OtelSpanBackend {
    fn start_span(
        &self,
        name: &str,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: Option<&Context>,
    ) -> Box<dyn HookSpan> {
        let tracer = global::tracer(self.tracer_name);
        // An explicit empty context keeps unparented spans out of whatever
        // happens to be current on this thread.
        let parent_cx = parent.cloned().unwrap_or_else(Context::new);
        let span = tracer
            .span_builder(name.to_string())
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(&tracer, &parent_cx);

        Box::new(OtelHookSpan { span })
    }
}

struct OtelHookSpan {
    span: global::BoxedSpan,
}

impl fmt::Debug for OtelHookSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelHookSpan")
            .field("span_context", self.span.span_context())
            .finish()
    }
}

impl HookSpan for OtelHookSpan {
    fn span_context(&self) -> SpanContext {
        self.span.span_context().clone()
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        self.span.set_attribute(attribute);
    }

    fn set_status(&mut self, status: Status) {
        self.span.set_status(status);
    }

    fn end(&mut self) {
        self.span.end();
    }
}

/// Metrics recorder backed by an OpenTelemetry meter
///
/// Instruments are created on first use and cached by name.
pub struct OtelMetricsRecorder {
    meter: Meter,
    counters: Mutex<HashMap<String, Counter<u64>>>,
    histograms: Mutex<HashMap<String, Histogram<f64>>>,
}

impl fmt::Debug for OtelMetricsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters = self.counters.lock().map(|c| c.len()).unwrap_or_default();
        let histograms = self.histograms.lock().map(|h| h.len()).unwrap_or_default();
        f.debug_struct("OtelMetricsRecorder")
            .field("counters", &counters)
            .field("histograms", &histograms)
            .finish()
    }
}

impl OtelMetricsRecorder {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            counters: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    /// Recorder on the global meter provider
    pub fn global() -> Self {
        Self::new(global::meter(INSTRUMENTATION_NAME))
    }
}

impl MetricsRecorder for OtelMetricsRecorder {
    fn record_counter(&self, name: &str, value: u64, labels: &[KeyValue]) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(name.to_string()).or_insert_with(|| {
            let (description, unit) = describe(name);
            self.meter
                .u64_counter(name.to_string())
                .with_description(description)
                .with_unit(unit)
                .init()
        });
        counter.add(value, labels);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[KeyValue]) {
        let mut histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        let histogram = histograms.entry(name.to_string()).or_insert_with(|| {
            let (description, unit) = describe(name);
            self.meter
                .f64_histogram(name.to_string())
                .with_description(description)
                .with_unit(unit)
                .init()
        });
        histogram.record(value, labels);
    }
}

fn describe(name: &str) -> (&'static str, &'static str) {
    match name {
        names::TOKENS => ("Tokens consumed by agent turns", "{token}"),
        names::COST_USD => ("Estimated model cost", "USD"),
        names::CONTEXT_USED => ("Context window tokens in use", "{token}"),
        names::TURN_DURATION_MS => ("Agent turn duration", "ms"),
        names::TURNS => ("Completed agent turns", "{turn}"),
        names::TOOL_CALLS => ("Tool executions", "{call}"),
        names::SECURITY_DETECTIONS => ("Security detections on tool calls", "{detection}"),
        names::MESSAGES_RECEIVED => ("Inbound messages", "{message}"),
        names::SESSIONS => ("Session lifecycle events", "{event}"),
        names::CONTEXTS_REAPED => ("Trace contexts force-closed as stale", "{context}"),
        _ => ("", ""),
    }
}

/// Installed OpenTelemetry providers
pub struct TelemetryPipeline {
    meter_provider: Option<SdkMeterProvider>,
}

impl fmt::Debug for TelemetryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryPipeline")
            .field("metrics", &self.meter_provider.is_some())
            .finish()
    }
}

impl TelemetryPipeline {
    /// Flush and shut down both providers
    pub fn shutdown(self) {
        if let Some(meter_provider) = self.meter_provider {
            if let Err(e) = meter_provider.force_flush() {
                warn!("Metrics flush failed during shutdown: {}", e);
            }
            if let Err(e) = meter_provider.shutdown() {
                warn!("Metrics provider shutdown failed: {}", e);
            }
        }
        global::shutdown_tracer_provider();
        info!("OpenTelemetry pipeline shut down");
    }
}

/// Port-based protocol detection: 4318/4320 speak OTLP over HTTP, the rest gRPC
fn use_http_protocol(endpoint: &str) -> bool {
    endpoint.contains(":4318") || endpoint.contains(":4320") || endpoint.starts_with("https://")
}

fn with_signal_path(endpoint: &str, signal: &str) -> String {
    let suffix = format!("/v1/{}", signal);
    if endpoint.ends_with(&suffix) {
        endpoint.to_string()
    } else {
        format!("{}{}", endpoint.trim_end_matches('/'), suffix)
    }
}

/// Install global tracer and meter providers according to `settings`
///
/// Returns `Ok(None)` when telemetry is disabled. Must be called from
/// within a Tokio runtime because the batch processors run on it.
pub fn init_pipeline(
    settings: &TelemetrySettings,
) -> Result<Option<TelemetryPipeline>, HookTraceError> {
    if !settings.enabled {
        info!("Telemetry disabled, skipping OpenTelemetry initialization");
        return Ok(None);
    }
    settings.validate()?;

    let resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, settings.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        KeyValue::new(SERVICE_INSTANCE_ID, uuid::Uuid::new_v4().to_string()),
    ]);

    let mut builder = TracerProvider::builder()
        .with_config(opentelemetry_sdk::trace::Config::default().with_resource(resource.clone()));

    if let Some(ref endpoint) = settings.otlp_endpoint {
        let exporter = if use_http_protocol(endpoint) {
            let http_endpoint = with_signal_path(endpoint, "traces");
            info!("Using HTTP protocol for OTLP traces (endpoint: {})", http_endpoint);
            opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(http_endpoint)
                .build_span_exporter()
        } else {
            info!("Using gRPC protocol for OTLP traces (endpoint: {})", endpoint);
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()
        }
        .map_err(|e| {
            HookTraceError::initialization_error(format!("Failed to build OTLP exporter: {}", e))
        })?;

        let processor =
            BatchSpanProcessor::builder(exporter, opentelemetry_sdk::runtime::Tokio).build();
        builder = builder.with_span_processor(processor);
    }

    if settings.console_export {
        debug!("Enabling console span exporter");
        let processor = BatchSpanProcessor::builder(
            opentelemetry_stdout::SpanExporter::default(),
            opentelemetry_sdk::runtime::Tokio,
        )
        .build();
        builder = builder.with_span_processor(processor);
    }

    global::set_tracer_provider(builder.build());

    let meter_provider = match settings.otlp_endpoint {
        Some(ref endpoint) => Some(init_meter_provider(endpoint, settings, resource)?),
        None => None,
    };

    info!(
        service_name = %settings.service_name,
        otlp = settings.otlp_endpoint.is_some(),
        console = settings.console_export,
        "OpenTelemetry pipeline initialized"
    );

    Ok(Some(TelemetryPipeline { meter_provider }))
}

fn init_meter_provider(
    endpoint: &str,
    settings: &TelemetrySettings,
    resource: Resource,
) -> Result<SdkMeterProvider, HookTraceError> {
    let exporter = if use_http_protocol(endpoint) {
        opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(with_signal_path(endpoint, "metrics"))
            .build_metrics_exporter(
                Box::new(DefaultAggregationSelector::new()),
                Box::new(DefaultTemporalitySelector::new()),
            )
    } else {
        opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_metrics_exporter(
                Box::new(DefaultAggregationSelector::new()),
                Box::new(DefaultTemporalitySelector::new()),
            )
    }
    .map_err(|e| {
        HookTraceError::initialization_error(format!("Failed to build metrics exporter: {}", e))
    })?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(settings.metrics_export_interval)
        .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(meter_provider)
}
