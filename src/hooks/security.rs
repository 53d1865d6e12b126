//! Security check seam for tool calls
//!
//! Detection itself lives outside this crate. The tool hook hands every
//! call to a [`SecurityCheck`] and records whatever it reports.

use serde_json::Value;

/// How serious a finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// High and critical findings mark the tool span as failed
    pub fn is_error(&self) -> bool {
        *self >= Severity::High
    }
}

/// One detection on a tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityFinding {
    /// Detector category, e.g. `destructive_command`
    pub category: String,
    pub severity: Severity,
    /// Excerpt of the offending input; truncated before it is attached
    pub preview: String,
}

impl SecurityFinding {
    pub fn new(category: impl Into<String>, severity: Severity, preview: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            severity,
            preview: preview.into(),
        }
    }
}

/// Inspects a tool call before its span is closed
#[cfg_attr(test, mockall::automock)]
pub trait SecurityCheck: Send + Sync {
    fn inspect_tool_call(&self, tool_name: &str, params: &Value) -> Option<SecurityFinding>;
}

/// Security check that never reports anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecurityCheck;

impl SecurityCheck for NoSecurityCheck {
    fn inspect_tool_call(&self, _tool_name: &str, _params: &Value) -> Option<SecurityFinding> {
        None
    }
}
