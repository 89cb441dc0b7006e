//! Agent output stream parser.
//!
//! Workers emit one JSON object per line on stdout. This module turns that
//! byte stream into typed [`LogEvent`] values, staying lenient about unknown
//! keys and resilient to malformed lines and partial reads. Parsed events are
//! handed to the event bus, so nothing here ever waits on a consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum bytes kept of a content preview.
const PREVIEW_LIMIT: usize = 300;
/// Maximum bytes kept of an unrecognized passthrough line.
const RAW_LIMIT: usize = 200;

/// One typed event from the agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// Assistant prose.
    Assistant {
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// The agent invoked a tool.
    ToolUse {
        tool_name: String,
        input_preview: String,
        input_raw: Value,
    },
    /// A tool returned a value.
    ToolResult { preview: String },
    /// An error frame, or a line that did not parse.
    Error { message: String },
    /// End-of-turn summary.
    Result {
        turns: u64,
        cost_usd: f64,
        duration_ms: u64,
    },
    /// System notice from the agent CLI.
    System { text: String },
    /// Unrecognized object, passed through truncated.
    Raw { text: String },
}

impl LogEvent {
    /// Serialize for the event bus (object per frame).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("log event serializes")
    }
}

/// Truncate to at most `limit` bytes on a char boundary.
fn truncate_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Preview of an arbitrary JSON value.
fn preview_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate_bytes(&text, PREVIEW_LIMIT)
}

/// Parse one line of agent output into zero or more events.
///
/// Malformed JSON yields a single `Error` event; an object whose shape is
/// not recognized yields a truncated `Raw` passthrough.
pub fn parse_line(line: &str) -> Vec<LogEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return vec![LogEvent::Error {
                message: format!("malformed stream line: {e}"),
            }];
        }
    };

    let mut events = Vec::new();
    let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match kind {
        // ----------------------------------------------------------------
        // assistant -- message with text and/or tool_use content blocks
        // ----------------------------------------------------------------
        "assistant" => {
            let Some(content) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            else {
                events.push(raw_event(trimmed));
                return events;
            };
            for block in content {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            events.push(LogEvent::Assistant {
                                text: text.to_string(),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                    "tool_use" => {
                        let tool_name = block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        events.push(LogEvent::ToolUse {
                            tool_name,
                            input_preview: preview_value(&input),
                            input_raw: input,
                        });
                    }
                    _ => {}
                }
            }
        }

        // ----------------------------------------------------------------
        // tool_use / tool_result -- sometimes emitted top-level
        // ----------------------------------------------------------------
        "tool_use" => {
            let tool_name = value
                .get("name")
                .or_else(|| value.get("tool"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string();
            let input = value.get("input").cloned().unwrap_or(Value::Null);
            events.push(LogEvent::ToolUse {
                tool_name,
                input_preview: preview_value(&input),
                input_raw: input,
            });
        }
        "tool_result" => {
            let output = value
                .get("output")
                .or_else(|| value.get("content"))
                .cloned()
                .unwrap_or(Value::Null);
            events.push(LogEvent::ToolResult {
                preview: preview_value(&output),
            });
        }

        // ----------------------------------------------------------------
        // error
        // ----------------------------------------------------------------
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| value.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            events.push(LogEvent::Error { message });
        }

        // ----------------------------------------------------------------
        // result -- end of a turn
        // ----------------------------------------------------------------
        "result" => {
            events.push(LogEvent::Result {
                turns: value.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0),
                cost_usd: value
                    .get("total_cost_usd")
                    .or_else(|| value.get("cost_usd"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
                duration_ms: value
                    .get("duration_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            });
            if let Some(text) = value.get("result").and_then(|r| r.as_str()) {
                if !text.is_empty() {
                    events.push(LogEvent::Assistant {
                        text: text.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        // ----------------------------------------------------------------
        // system notice
        // ----------------------------------------------------------------
        "system" => {
            let text = value
                .get("message")
                .or_else(|| value.get("subtype"))
                .and_then(|m| m.as_str())
                .unwrap_or("system")
                .to_string();
            events.push(LogEvent::System { text });
        }

        // ----------------------------------------------------------------
        // anything else -- passthrough
        // ----------------------------------------------------------------
        _ => events.push(raw_event(trimmed)),
    }

    events
}

fn raw_event(line: &str) -> LogEvent {
    LogEvent::Raw {
        text: truncate_bytes(line, RAW_LIMIT),
    }
}

/// Buffers a byte stream and yields complete lines.
///
/// Container log streams deliver arbitrary chunks; a JSON object may span
/// reads. Feed chunks in, take complete lines out; anything after the last
/// newline stays buffered until the next chunk (or [`LineAssembler::finish`]).
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return all lines completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing unterminated line at end of stream.
    pub fn finish(self) -> Option<String> {
        let rest = self.buffer.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_assistant_text() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}"#;
        let events = parse_line(line);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LogEvent::Assistant { text, .. } if text == "Hello"));
    }

    #[test]
    fn parse_assistant_with_tool_use_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Running ls"},{"type":"tool_use","name":"Bash","input":{"command":"ls -la"}}]}}"#;
        let events = parse_line(line);
        assert_eq!(events.len(), 2);
        match &events[1] {
            LogEvent::ToolUse {
                tool_name,
                input_preview,
                input_raw,
            } => {
                assert_eq!(tool_name, "Bash");
                assert!(input_preview.contains("ls -la"));
                assert_eq!(input_raw["command"], "ls -la");
            }
            other => panic!("expected ToolUse, got {other:?}"),
        }
    }

    #[test]
    fn parse_top_level_tool_use() {
        let line = r#"{"type":"tool_use","name":"Read","input":{"path":"/tmp/a.rs"}}"#;
        let events = parse_line(line);
        assert!(matches!(&events[0], LogEvent::ToolUse { tool_name, .. } if tool_name == "Read"));
    }

    #[test]
    fn parse_tool_result_truncates_preview() {
        let payload = "x".repeat(1000);
        let line = format!(r#"{{"type":"tool_result","output":"{payload}"}}"#);
        let events = parse_line(&line);
        match &events[0] {
            LogEvent::ToolResult { preview } => {
                assert!(preview.len() <= PREVIEW_LIMIT + '…'.len_utf8());
                assert!(preview.ends_with('…'));
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_nested_and_flat() {
        let nested = parse_line(r#"{"type":"error","error":{"message":"rate limited"}}"#);
        assert!(matches!(&nested[0], LogEvent::Error { message } if message == "rate limited"));

        let flat = parse_line(r#"{"type":"error","message":"broke"}"#);
        assert!(matches!(&flat[0], LogEvent::Error { message } if message == "broke"));
    }

    #[test]
    fn parse_result_frame() {
        let line =
            r#"{"type":"result","num_turns":7,"total_cost_usd":0.42,"duration_ms":90000,"result":"Done."}"#;
        let events = parse_line(line);
        assert!(matches!(
            &events[0],
            LogEvent::Result {
                turns: 7,
                duration_ms: 90000,
                ..
            }
        ));
        assert!(matches!(&events[1], LogEvent::Assistant { text, .. } if text == "Done."));
    }

    #[test]
    fn parse_system_notice() {
        let events = parse_line(r#"{"type":"system","subtype":"init"}"#);
        assert!(matches!(&events[0], LogEvent::System { text } if text == "init"));
    }

    #[test]
    fn malformed_line_becomes_error() {
        let events = parse_line("definitely not json");
        assert!(matches!(&events[0], LogEvent::Error { message } if message.contains("malformed")));
    }

    #[test]
    fn unknown_object_becomes_truncated_raw() {
        let long_field = "y".repeat(500);
        let line = format!(r#"{{"type":"telemetry","data":"{long_field}"}}"#);
        let events = parse_line(&line);
        match &events[0] {
            LogEvent::Raw { text } => assert!(text.len() <= RAW_LIMIT + '…'.len_utf8()),
            other => panic!("expected Raw, got {other:?}"),
        }
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_line("").is_empty());
        assert!(parse_line("   ").is_empty());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(400);
        let t = truncate_bytes(&s, PREVIEW_LIMIT);
        // Must not panic and must stay within budget.
        assert!(t.len() <= PREVIEW_LIMIT + '…'.len_utf8());
    }

    #[test]
    fn assembler_buffers_partial_lines() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(b"{\"type\":").is_empty());
        let lines = assembler.push(b"\"system\",\"subtype\":\"init\"}\n{\"half");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("system"));
        assert_eq!(assembler.finish().as_deref(), Some("{\"half"));
    }

    #[test]
    fn assembler_handles_multiple_lines_per_chunk() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.push(b"one\r\ntwo\nthree\n");
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert!(assembler.finish().is_none());
    }
}
