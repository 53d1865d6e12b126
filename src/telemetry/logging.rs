//! Diagnostic logging setup
//!
//! The hooks log through `tracing` macros. Hosts that already install a
//! subscriber need nothing from this module; standalone deployments call
//! [`init_logging`] once at startup and keep the returned guard alive.

use std::path::PathBuf;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::HookTraceError;

/// Configuration for diagnostic logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `hooktrace=debug,info`
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json_format: bool,
    /// Also write daily-rotated log files into this directory
    pub log_dir: Option<PathBuf>,
    /// Write to stderr
    pub console_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_dir: None,
            console_enabled: true,
        }
    }
}

impl LoggingConfig {
    /// Create logging configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("HOOKTRACE_LOG_LEVEL") {
            config.level = level;
        }
        if let Ok(log_dir) = std::env::var("HOOKTRACE_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(log_dir));
        }
        if let Ok(json) = std::env::var("HOOKTRACE_JSON_LOGS") {
            config.json_format = json.parse().unwrap_or(false);
        }

        config
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Guard that must be kept alive for the duration of the application
/// to ensure log files are flushed
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global `tracing` subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, HookTraceError> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.console_enabled {
        let console = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true);
        let layer: BoxedLayer = if config.json_format {
            console.json().with_filter(config.filter()).boxed()
        } else {
            console.with_filter(config.filter()).boxed()
        };
        layers.push(layer);
    }

    if let Some(ref log_dir) = config.log_dir {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            HookTraceError::configuration_error(format!("Failed to create log directory: {}", e))
        })?;
        let file_appender = tracing_appender::rolling::daily(log_dir, "hooktrace.log");
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
        file_guard = Some(guard);

        let file = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::new(
                "%Y-%m-%d %H:%M:%S%.3f UTC".to_string(),
            ))
            .with_file(true)
            .with_line_number(true);
        let layer: BoxedLayer = if config.json_format {
            file.json().with_filter(config.filter()).boxed()
        } else {
            file.with_filter(config.filter()).boxed()
        };
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| {
            HookTraceError::configuration_error(format!(
                "Failed to set global tracing subscriber: {}",
                e
            ))
        })?;

    info!(
        level = %config.level,
        json_format = config.json_format,
        log_dir = ?config.log_dir,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
