//! Per-line payload parsing shared by the SSE and NDJSON paths.
//!
//! Each complete line is either an SSE comment, the `[DONE]` terminal
//! marker, or a JSON object carrying a content delta. A line that fails to
//! parse as JSON degrades to its raw text so one corrupt chunk never loses
//! the rest of the response.

use serde_json::Value;

/// How many times a gateway-wrapped body is unwrapped before giving up.
/// Serverless gateways have been observed double- and triple-encoding the
/// payload; the bound keeps malformed input from looping forever.
pub(crate) const MAX_UNWRAP_DEPTH: usize = 3;

/// Outcome of parsing one complete line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineEvent {
    /// A content delta to append.
    Delta(String),
    /// The `[DONE]` terminal marker.
    Terminal,
    /// Nothing useful on this line (blank, comment, metadata-only event).
    Ignored,
}

/// Parse one line of an SSE or NDJSON stream.
pub(crate) fn parse_line(raw: &str) -> LineEvent {
    let line = raw.trim();
    if line.is_empty() {
        return LineEvent::Ignored;
    }
    // SSE comment lines start with a colon.
    if line.starts_with(':') {
        return LineEvent::Ignored;
    }

    let payload = line.strip_prefix("data:").map_or(line, str::trim);
    if payload.is_empty() {
        return LineEvent::Ignored;
    }
    if payload == "[DONE]" {
        return LineEvent::Terminal;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => extract_delta(&value).map_or(LineEvent::Ignored, LineEvent::Delta),
        // Malformed chunk: keep the raw text rather than aborting the stream.
        Err(_) => LineEvent::Delta(payload.to_string()),
    }
}

/// Extract the content delta from a per-chunk JSON object.
///
/// Fields are tried in order: `content`, `text`, `delta` (string), then
/// `delta.content` / `delta.text` for chat-completions-style chunks.
pub(crate) fn extract_delta(value: &Value) -> Option<String> {
    for key in ["content", "text"] {
        if let Some(s) = value.get(key).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }
    match value.get("delta") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(delta @ Value::Object(_)) => {
            for key in ["content", "text"] {
                if let Some(s) = delta.get(key).and_then(Value::as_str) {
                    return Some(s.to_string());
                }
            }
            None
        }
        _ => None,
    }
}

/// Extract the message text from a plain (non-streamed) JSON response body.
pub(crate) fn extract_body_text(value: &Value) -> Option<String> {
    for key in ["content", "message", "response"] {
        if let Some(s) = value.get(key).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }
    None
}

/// Unwrap a gateway-wrapped body: outer JSON with a string `body` field
/// holding the real payload, possibly wrapped more than once.
///
/// Returns the innermost string payload, or `None` when the value carries
/// no `body` field at all.
pub(crate) fn unwrap_gateway(value: &Value) -> Option<String> {
    let mut inner = value.get("body").and_then(Value::as_str)?.to_string();

    for _ in 1..MAX_UNWRAP_DEPTH {
        match serde_json::from_str::<Value>(&inner) {
            Ok(next) => match next.get("body").and_then(Value::as_str) {
                Some(deeper) => inner = deeper.to_string(),
                None => break,
            },
            Err(_) => break,
        }
    }

    Some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_sse_data_line() {
        assert_eq!(
            parse_line(r#"data: {"content":"Hi"}"#),
            LineEvent::Delta("Hi".into())
        );
    }

    #[test]
    fn parses_ndjson_line_without_prefix() {
        assert_eq!(
            parse_line(r#"{"text":"chunk"}"#),
            LineEvent::Delta("chunk".into())
        );
    }

    #[test]
    fn done_marker_is_terminal() {
        assert_eq!(parse_line("data: [DONE]"), LineEvent::Terminal);
        assert_eq!(parse_line("[DONE]"), LineEvent::Terminal);
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        assert_eq!(parse_line(": keep-alive"), LineEvent::Ignored);
        assert_eq!(parse_line(""), LineEvent::Ignored);
        assert_eq!(parse_line("   "), LineEvent::Ignored);
        assert_eq!(parse_line("data:"), LineEvent::Ignored);
    }

    #[test]
    fn malformed_json_degrades_to_raw_text() {
        assert_eq!(
            parse_line(r#"data: {"content": "unterminated"#),
            LineEvent::Delta(r#"{"content": "unterminated"#.into())
        );
    }

    #[test]
    fn metadata_only_events_are_ignored() {
        assert_eq!(parse_line(r#"data: {"event":"ping"}"#), LineEvent::Ignored);
    }

    #[test]
    fn extracts_delta_variants() {
        assert_eq!(extract_delta(&json!({"content": "a"})), Some("a".into()));
        assert_eq!(extract_delta(&json!({"text": "b"})), Some("b".into()));
        assert_eq!(extract_delta(&json!({"delta": "c"})), Some("c".into()));
        assert_eq!(
            extract_delta(&json!({"delta": {"content": "d"}})),
            Some("d".into())
        );
        assert_eq!(extract_delta(&json!({"usage": {}})), None);
    }

    #[test]
    fn extracts_plain_body_text() {
        assert_eq!(
            extract_body_text(&json!({"message": "hello"})),
            Some("hello".into())
        );
        assert_eq!(
            extract_body_text(&json!({"response": "world"})),
            Some("world".into())
        );
        assert_eq!(extract_body_text(&json!({"other": 1})), None);
    }

    #[test]
    fn unwraps_single_and_double_wrapped_bodies() {
        let sse = "data: {\"content\":\"x\"}\n\ndata: [DONE]\n";
        let once = json!({ "body": sse });
        assert_eq!(unwrap_gateway(&once).as_deref(), Some(sse));

        let twice = json!({ "body": once.to_string() });
        assert_eq!(unwrap_gateway(&twice).as_deref(), Some(sse));
    }

    #[test]
    fn unwrap_depth_is_bounded() {
        // Four levels deep: the bound stops at three unwraps.
        let sse = "data: [DONE]";
        let mut wrapped = json!({ "body": sse });
        for _ in 0..3 {
            wrapped = json!({ "body": wrapped.to_string() });
        }
        let inner = unwrap_gateway(&wrapped).unwrap();
        // Still one wrapper left, proving the loop terminated at the bound.
        assert!(inner.contains("body"));
    }

    #[test]
    fn unwrap_returns_none_without_body_field() {
        assert_eq!(unwrap_gateway(&json!({"content": "x"})), None);
    }
}
