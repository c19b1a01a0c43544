//! Incremental stream decoding and buffered-body decoding.

use serde_json::Value;

use super::line::{extract_body_text, parse_line, unwrap_gateway, LineEvent};
use crate::error::ChatError;

/// Event produced by the decoder, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A content delta to append to the response.
    Delta(String),
    /// Terminal event carrying the full accumulated text. Fires exactly
    /// once, after the last delta. Empty text is valid.
    Done(String),
}

/// The wire shape a response body arrives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    /// A single JSON object with `content`/`message`/`response`.
    Json,
    /// `text/event-stream` lines prefixed with `data:`.
    Sse,
    /// Newline-delimited JSON without the `data:` prefix.
    NdJson,
    /// Outer JSON whose `body` string field holds an SSE payload
    /// (serverless gateway passthrough artifact).
    JsonWrappedSse,
}

impl WireShape {
    /// Detect the shape from the content-type hint plus payload sniffing.
    pub fn detect(content_type: Option<&str>, body: &str) -> Self {
        if let Some(ct) = content_type.map(str::to_ascii_lowercase) {
            if ct.contains("text/event-stream") {
                return Self::Sse;
            }
            if ct.contains("ndjson") {
                return Self::NdJson;
            }
        }

        let trimmed = body.trim_start();
        if trimmed.starts_with("data:") || trimmed.starts_with(':') {
            return Self::Sse;
        }
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            let wrapped = value
                .get("body")
                .and_then(Value::as_str)
                .is_some_and(|inner| inner.contains("data:"));
            if wrapped {
                return Self::JsonWrappedSse;
            }
            return Self::Json;
        }
        // Not one JSON document; NDJSON if the first line parses on its own.
        let first_line = trimmed.lines().next().unwrap_or_default();
        if serde_json::from_str::<Value>(first_line).is_ok() {
            return Self::NdJson;
        }
        Self::Json
    }
}

/// Incremental decoder for line-oriented streams (SSE and NDJSON).
///
/// Chunks may split lines arbitrarily: only text up to the last newline in
/// the accumulated buffer is parsed; the trailing partial line is held
/// until more data arrives and flushed by [`StreamDecoder::finish`].
///
/// The decoder is finite and non-restartable: once the terminal event has
/// been emitted, further input is ignored.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: String,
    text: String,
    done: bool,
}

impl StreamDecoder {
    /// Create a decoder with empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stream text, returning the events it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<DecodeEvent> {
        if self.done {
            return Vec::new();
        }
        self.buffer.push_str(chunk);

        let Some(split) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(split + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        let mut events = Vec::new();
        for line in complete.lines() {
            match parse_line(line) {
                LineEvent::Delta(delta) => {
                    self.text.push_str(&delta);
                    events.push(DecodeEvent::Delta(delta));
                }
                LineEvent::Terminal => {
                    self.done = true;
                    events.push(DecodeEvent::Done(self.text.clone()));
                    break;
                }
                LineEvent::Ignored => {}
            }
        }
        events
    }

    /// Signal end of stream: flush any buffered partial line and emit the
    /// terminal event if the stream never carried a `[DONE]` marker.
    pub fn finish(&mut self) -> Vec<DecodeEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = Vec::new();
        let tail = std::mem::take(&mut self.buffer);
        if !tail.is_empty() {
            match parse_line(&tail) {
                LineEvent::Delta(delta) => {
                    self.text.push_str(&delta);
                    events.push(DecodeEvent::Delta(delta));
                }
                LineEvent::Terminal | LineEvent::Ignored => {}
            }
        }
        self.done = true;
        events.push(DecodeEvent::Done(self.text.clone()));
        events
    }

    /// Text accumulated so far.
    pub fn accumulated(&self) -> &str {
        &self.text
    }

    /// Whether the terminal event has been emitted.
    pub const fn is_done(&self) -> bool {
        self.done
    }
}

/// Decode a complete (buffered) response body into its event sequence.
///
/// For `application/json` bodies a parse failure is a hard
/// [`ChatError::Decode`]; partially-parsed data is never returned as
/// success. Line-oriented bodies reuse the lenient per-line rules.
pub fn decode_body(content_type: Option<&str>, body: &str) -> Result<Vec<DecodeEvent>, ChatError> {
    match WireShape::detect(content_type, body) {
        WireShape::Json => {
            let value: Value = serde_json::from_str(body)
                .map_err(|e| ChatError::Decode(format!("invalid JSON body: {e}")))?;
            let mut events = Vec::new();
            let text = extract_body_text(&value).unwrap_or_default();
            if !text.is_empty() {
                events.push(DecodeEvent::Delta(text.clone()));
            }
            events.push(DecodeEvent::Done(text));
            Ok(events)
        }
        WireShape::JsonWrappedSse => {
            let value: Value = serde_json::from_str(body)
                .map_err(|e| ChatError::Decode(format!("invalid gateway body: {e}")))?;
            let inner = unwrap_gateway(&value)
                .ok_or_else(|| ChatError::Decode("gateway body field missing".into()))?;
            Ok(decode_lines(&inner))
        }
        WireShape::Sse | WireShape::NdJson => Ok(decode_lines(body)),
    }
}

fn decode_lines(body: &str) -> Vec<DecodeEvent> {
    let mut decoder = StreamDecoder::new();
    let mut events = decoder.feed(body);
    events.extend(decoder.finish());
    events
}
