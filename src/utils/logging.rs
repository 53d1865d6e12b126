//! String helpers for values that end up in logs and span attributes
//!
//! Span attributes carry user text (prompts, completions, error messages, tool
//! parameters). These helpers bound that text without ever splitting a UTF-8
//! character.

/// Safely truncates a string to a maximum number of characters, respecting UTF-8 boundaries
///
/// # Examples
///
/// ```rust
/// use hooktrace::utils::logging::truncate_string;
///
/// assert_eq!(truncate_string("Hello World", 5), "Hello");
/// assert_eq!(truncate_string("Short", 100), "Short");
/// ```
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Truncates `s` and reports whether anything was cut off
pub fn truncate_checked(s: &str, max_chars: usize) -> (String, bool) {
    let mut chars = s.chars();
    let kept: String = chars.by_ref().take(max_chars).collect();
    let truncated = chars.next().is_some();
    (kept, truncated)
}

/// Builds a single-line preview: whitespace runs collapse to one space, then
/// the result is truncated to `max_chars`
///
/// ```rust
/// use hooktrace::utils::logging::single_line_preview;
///
/// assert_eq!(single_line_preview("rm -rf\n   /tmp/x", 100), "rm -rf /tmp/x");
/// ```
pub fn single_line_preview(s: &str, max_chars: usize) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_string(&collapsed, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello World", 5), "Hello");

        // Multi-byte characters are never split
        assert_eq!(truncate_string("Hello 👋 World!", 7), "Hello 👋");
        assert_eq!(truncate_string("👋👋👋👋👋", 3), "👋👋👋");
        assert_eq!(truncate_string("日本語テキスト", 3), "日本語");

        assert_eq!(truncate_string("Short", 100), "Short");
        assert_eq!(truncate_string("", 10), "");
    }

    #[test]
    fn test_truncate_checked() {
        assert_eq!(truncate_checked("boom", 10), ("boom".to_string(), false));
        assert_eq!(truncate_checked("boom", 4), ("boom".to_string(), false));
        assert_eq!(truncate_checked("boom!", 4), ("boom".to_string(), true));
    }

    #[test]
    fn test_single_line_preview() {
        assert_eq!(single_line_preview("  a\tb\n\nc  ", 10), "a b c");
        assert_eq!(single_line_preview("abc def", 5), "abc d");
    }
}
