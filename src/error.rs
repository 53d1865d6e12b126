//! Error handling for the hooktrace library
//!
//! Errors in this crate never cross into the host's control flow. Internal
//! steps return [`HookTraceError`] so the failure can be described precisely,
//! and the lifecycle handlers in [`crate::hooks`] turn every error into a log
//! line at their boundary.
//!
//! # Error Categories
//!
//! - **Configuration** - invalid settings, unreadable files, exporter setup
//! - **Invalid payload** - a lifecycle event payload that cannot be decoded
//! - **Span / metrics** - failures reported by the span or metrics primitive
//! - **Handler fault** - a panic caught at a handler boundary
//!
//! ```rust
//! use hooktrace::HookTraceError;
//!
//! let error = HookTraceError::invalid_payload("agent_end: expected an object");
//! assert!(error.is_payload_error());
//! assert_eq!(error.to_string(), "Invalid payload: agent_end: expected an object");
//! ```

use thiserror::Error;

/// Main error type for the hooktrace library
#[derive(Error, Debug, Clone)]
pub enum HookTraceError {
    /// Configuration errors (settings, files, exporter wiring)
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// Lifecycle event payload could not be decoded
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    /// The span primitive failed
    #[error("Span error: {message}")]
    SpanError { message: String },

    /// Telemetry pipeline could not be installed
    #[error("Initialization error: {message}")]
    InitializationError { message: String },

    /// A handler panicked and was stopped at its boundary
    #[error("Handler fault in {handler}: {message}")]
    HandlerFault { handler: String, message: String },
}

impl HookTraceError {
    /// Create a ConfigurationError
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Create an InvalidPayload error
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Create a SpanError
    pub fn span_error(message: impl Into<String>) -> Self {
        Self::SpanError {
            message: message.into(),
        }
    }

    /// Create an InitializationError
    pub fn initialization_error(message: impl Into<String>) -> Self {
        Self::InitializationError {
            message: message.into(),
        }
    }

    /// Create a HandlerFault
    pub fn handler_fault(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFault {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Check if this error came from a malformed event payload
    pub fn is_payload_error(&self) -> bool {
        matches!(self, HookTraceError::InvalidPayload { .. })
    }

    /// Check if this error came from the span primitive rather than the
    /// hook logic itself
    pub fn is_primitive_error(&self) -> bool {
        matches!(self, HookTraceError::SpanError { .. })
    }
}

impl From<serde_json::Error> for HookTraceError {
    fn from(error: serde_json::Error) -> Self {
        HookTraceError::invalid_payload(format!("JSON decoding failed: {}", error))
    }
}

impl From<crate::config::ConfigError> for HookTraceError {
    fn from(error: crate::config::ConfigError) -> Self {
        HookTraceError::configuration_error(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HookTraceError::span_error("exporter unreachable");
        assert_eq!(error.to_string(), "Span error: exporter unreachable");

        let fault = HookTraceError::handler_fault("agent_end", "index out of bounds");
        assert_eq!(
            fault.to_string(),
            "Handler fault in agent_end: index out of bounds"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(HookTraceError::invalid_payload("x").is_payload_error());
        assert!(!HookTraceError::configuration_error("x").is_payload_error());
        assert!(HookTraceError::span_error("x").is_primitive_error());
        assert!(!HookTraceError::initialization_error("x").is_primitive_error());
    }

    #[test]
    fn test_from_serde_json_error() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: HookTraceError = parse_error.into();
        assert!(error.is_payload_error());
    }
}
