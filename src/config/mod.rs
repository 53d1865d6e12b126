//! Configuration for the hooktrace plugin
//!
//! Settings come from a file (TOML, YAML or JSON), from environment
//! variables, or from both with the environment taking precedence.
//!
//! ```toml
//! capture_content = true
//!
//! [reaper]
//! sweep_interval = 60
//! stale_after = 300
//!
//! [telemetry]
//! enabled = true
//! otlp_endpoint = "http://localhost:4317"
//! service_name = "openclaw-gateway"
//! ```

use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable parsing error: {0}")]
    EnvVarParse(String),
    #[error("File parsing error: {0}")]
    FileParse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main configuration structure for the hooktrace plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookTraceConfig {
    /// Attach the last user/assistant text to agent spans
    #[serde(default)]
    pub capture_content: bool,
    /// Maximum characters kept for prompt and completion attributes
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    /// Maximum characters kept for error message attributes
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,
    /// Maximum characters kept for security detection previews
    #[serde(default = "default_max_security_preview_chars")]
    pub max_security_preview_chars: usize,
    /// Stale-context reaper settings
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// OpenTelemetry export settings
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// Stale-context reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// How often the sweep runs
    #[serde(with = "duration_seconds", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    /// Age after which an unfinished context is force-closed
    #[serde(with = "duration_seconds", default = "default_stale_after")]
    pub stale_after: Duration,
}

/// OpenTelemetry export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Whether the OpenTelemetry pipeline is installed
    #[serde(default)]
    pub enabled: bool,
    /// OTLP endpoint URL
    pub otlp_endpoint: Option<String>,
    /// Also print spans to stdout
    #[serde(default)]
    pub console_export: bool,
    /// Service name reported on the resource
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Interval between metric exports
    #[serde(with = "duration_seconds", default = "default_metrics_export_interval")]
    pub metrics_export_interval: Duration,
}

impl Default for HookTraceConfig {
    fn default() -> Self {
        Self {
            capture_content: false,
            max_content_chars: default_max_content_chars(),
            max_error_chars: default_max_error_chars(),
            max_security_preview_chars: default_max_security_preview_chars(),
            reaper: ReaperConfig::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            stale_after: default_stale_after(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: None,
            console_export: false,
            service_name: default_service_name(),
            metrics_export_interval: default_metrics_export_interval(),
        }
    }
}

impl HookTraceConfig {
    /// Load configuration from a file (supports TOML, YAML, JSON)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str());

        match extension {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            _ => Err(ConfigError::FileParse(
                "Unsupported file format. Use .toml, .yaml, .yml, or .json".to_string(),
            )),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment variable overrides on top of this configuration
    pub fn merge_with_env(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(capture) = env::var("HOOKTRACE_CAPTURE_CONTENT") {
            self.capture_content = capture == "true";
        }
        if let Ok(secs) = env::var("HOOKTRACE_STALE_AFTER_SECS") {
            self.reaper.stale_after = Duration::from_secs(secs.parse().map_err(|e| {
                ConfigError::EnvVarParse(format!("HOOKTRACE_STALE_AFTER_SECS: {}", e))
            })?);
        }
        if let Ok(secs) = env::var("HOOKTRACE_SWEEP_INTERVAL_SECS") {
            self.reaper.sweep_interval = Duration::from_secs(secs.parse().map_err(|e| {
                ConfigError::EnvVarParse(format!("HOOKTRACE_SWEEP_INTERVAL_SECS: {}", e))
            })?);
        }

        if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.telemetry.enabled = true;
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
        if let Ok(service_name) = env::var("OTEL_SERVICE_NAME") {
            self.telemetry.service_name = service_name;
        }
        if let Ok(console_export) = env::var("HOOKTRACE_CONSOLE_EXPORT") {
            self.telemetry.console_export = console_export == "true";
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "Reaper sweep interval must be greater than 0".to_string(),
            ));
        }
        if self.reaper.stale_after.is_zero() {
            return Err(ConfigError::Validation(
                "Reaper stale threshold must be greater than 0".to_string(),
            ));
        }
        if self.max_content_chars == 0 || self.max_error_chars == 0 {
            return Err(ConfigError::Validation(
                "Attribute length limits must be greater than 0".to_string(),
            ));
        }
        self.telemetry.validate()
    }
}

impl TelemetrySettings {
    /// Validate the telemetry section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::Validation(
                "Service name cannot be empty".to_string(),
            ));
        }
        if self.metrics_export_interval.is_zero() {
            return Err(ConfigError::Validation(
                "Metrics export interval must be greater than 0".to_string(),
            ));
        }
        match (&self.otlp_endpoint, self.enabled) {
            (None, true) if !self.console_export => Err(ConfigError::Validation(
                "OTLP endpoint or console export required when telemetry is enabled".to_string(),
            )),
            (Some(endpoint), _) => url::Url::parse(endpoint).map(|_| ()).map_err(|e| {
                ConfigError::Validation(format!("Invalid OTLP endpoint '{}': {}", endpoint, e))
            }),
            _ => Ok(()),
        }
    }
}

/// Custom serialization for Duration as seconds
mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Default value functions for serde
fn default_max_content_chars() -> usize {
    2000
}

fn default_max_error_chars() -> usize {
    500
}

fn default_max_security_preview_chars() -> usize {
    200
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_service_name() -> String {
    "openclaw-gateway".to_string()
}

fn default_metrics_export_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_config() {
        let config = HookTraceConfig::default();
        assert!(!config.capture_content);
        assert_eq!(config.max_content_chars, 2000);
        assert_eq!(config.max_error_chars, 500);
        assert_eq!(config.reaper.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.reaper.stale_after, Duration::from_secs(300));
        assert!(!config.telemetry.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = HookTraceConfig::default();
        config.reaper.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HookTraceConfig::default();
        config.telemetry.enabled = true;
        assert!(config.validate().is_err());

        config.telemetry.otlp_endpoint = Some("not a url".to_string());
        assert!(config.validate().is_err());

        config.telemetry.otlp_endpoint = Some("http://localhost:4317".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_config_loading() {
        let toml_content = r#"
capture_content = true
max_content_chars = 128

[reaper]
sweep_interval = 5
stale_after = 30

[telemetry]
enabled = true
otlp_endpoint = "http://collector:4318"
service_name = "test-gateway"
"#;

        let mut temp_file = Builder::new().suffix(".toml").tempfile().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = HookTraceConfig::from_file(temp_file.path()).unwrap();
        assert!(config.capture_content);
        assert_eq!(config.max_content_chars, 128);
        assert_eq!(config.max_error_chars, 500);
        assert_eq!(config.reaper.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.reaper.stale_after, Duration::from_secs(30));
        assert_eq!(config.telemetry.service_name, "test-gateway");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_config_loading() {
        let yaml_content = r#"
capture_content: false
reaper:
  stale_after: 120
telemetry:
  console_export: true
"#;

        let mut temp_file = Builder::new().suffix(".yaml").tempfile().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = HookTraceConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.reaper.stale_after, Duration::from_secs(120));
        assert_eq!(config.reaper.sweep_interval, Duration::from_secs(60));
        assert!(config.telemetry.console_export);
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_file = Builder::new().suffix(".ini").tempfile().unwrap();
        let result = HookTraceConfig::from_file(temp_file.path());
        assert!(matches!(result, Err(ConfigError::FileParse(_))));
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("HOOKTRACE_CAPTURE_CONTENT", "true");
        env::set_var("HOOKTRACE_STALE_AFTER_SECS", "42");

        let config = HookTraceConfig::default().merge_with_env().unwrap();
        assert!(config.capture_content);
        assert_eq!(config.reaper.stale_after, Duration::from_secs(42));

        env::set_var("HOOKTRACE_STALE_AFTER_SECS", "soon");
        assert!(matches!(
            HookTraceConfig::from_env(),
            Err(ConfigError::EnvVarParse(_))
        ));

        env::remove_var("HOOKTRACE_CAPTURE_CONTENT");
        env::remove_var("HOOKTRACE_STALE_AFTER_SECS");
    }
}
