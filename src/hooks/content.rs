//! Reading transcripts and tool results
//!
//! Message content is either a plain string or an array of typed parts
//! (`{"type": "text", "text": ...}`, images, tool calls). Anything else is
//! treated as empty.

use serde::Deserialize;
use serde_json::Value;

use super::events::TokenUsage;
use super::usage::{UsageSnapshot, UsageSource, UsageTotals};

/// One transcript message, as much of it as the hooks care about
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: Value,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

impl TranscriptMessage {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    pub fn text(&self) -> String {
        flatten_text(&self.content)
    }
}

/// Decode a raw transcript, skipping entries that are not message objects
pub fn parse_transcript(messages: &[Value]) -> Vec<TranscriptMessage> {
    messages
        .iter()
        .filter_map(|raw| serde_json::from_value::<TranscriptMessage>(raw.clone()).ok())
        .collect()
}

fn part_text(part: &Value) -> Option<&str> {
    let is_text = part
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t == "text")
        .unwrap_or(true);
    if is_text {
        part.get("text").and_then(Value::as_str)
    } else {
        None
    }
}

/// Text of a string or typed-part content value; text parts join with newlines
pub fn flatten_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(part_text)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Size of a tool result shaped as an array of typed parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSize {
    /// Characters across all text parts
    pub chars: usize,
    /// Number of parts of any type
    pub parts: usize,
}

pub fn result_size(content: &Value) -> Option<ResultSize> {
    let parts = content.as_array()?;
    let chars = parts
        .iter()
        .filter_map(part_text)
        .map(|text| text.chars().count())
        .sum();
    Some(ResultSize {
        chars,
        parts: parts.len(),
    })
}

/// Text of the last message with a non-empty text body for `role`
pub fn last_text_for_role(messages: &[TranscriptMessage], role: &str) -> Option<String> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == role)
        .map(TranscriptMessage::text)
        .find(|text| !text.trim().is_empty())
}

/// Usage summed over every assistant message in the turn
///
/// A turn can contain several model calls, each reporting its own usage, so
/// every assistant message counts, not just the last. Model and provider come
/// from the last assistant message that names them.
pub fn transcript_usage(messages: &[TranscriptMessage]) -> UsageSnapshot {
    let mut tokens: Option<UsageTotals> = None;
    let mut cost: Option<f64> = None;
    let mut model = None;
    let mut provider = None;

    for message in messages.iter().filter(|m| m.is_assistant()) {
        if let Some(ref usage) = message.usage {
            match tokens {
                Some(ref mut totals) => totals.add(usage),
                None => tokens = Some(UsageTotals::from_usage(usage)),
            }
            if let Some(total) = usage.cost.as_ref().and_then(|c| c.total) {
                cost = Some(cost.unwrap_or(0.0) + total);
            }
        }
        if message.model.is_some() {
            model = message.model.clone();
        }
        if message.provider.is_some() {
            provider = message.provider.clone();
        }
    }

    UsageSnapshot {
        source: UsageSource::Transcript,
        tokens: tokens.unwrap_or_default(),
        cost_usd: cost,
        context_limit: None,
        context_used: None,
        duration_ms: None,
        provider,
        model,
    }
}
