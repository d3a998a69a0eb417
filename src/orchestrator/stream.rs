//! Line parser for the agent's streamed JSON output.
//!
//! Complete lines are decoded with `serde_json`; lines that do not parse
//! (truncated writes, interleaved text) still go through the partial-field
//! extractor so a file-write intent is spotted as early as possible.

use crate::arbiter::{extract_string_field, try_extract_file_path_from_partial};
use crate::types::TokenUsage;
use serde_json::Value;

/// Something of interest found in one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A tool-use content block opened.
    ToolUseStart {
        index: Option<u64>,
        name: String,
        file_path: Option<String>,
    },
    /// A slice of a tool's JSON input.
    ToolInputDelta { index: Option<u64>, partial_json: String },
    BlockStop { index: Option<u64> },
    /// A fully formed tool call from an assistant message.
    ToolUse { name: String, file_path: Option<String> },
    /// Tool name and path recovered from a line that is not valid JSON.
    Fragment { name: Option<String>, file_path: String },
    Result {
        is_error: bool,
        text: Option<String>,
        usage: Option<TokenUsage>,
    },
}

/// Decode one line of agent output into zero or more events.
pub fn parse_line(line: &str) -> Vec<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => parse_value(&value),
        Err(_) => parse_fragment(trimmed).into_iter().collect(),
    }
}

fn parse_fragment(line: &str) -> Option<StreamEvent> {
    let start = line.find('{')?;
    let fragment = &line[start..];
    let file_path = try_extract_file_path_from_partial(fragment)?;
    let name = extract_string_field(fragment, "name")
        .filter(|f| f.complete)
        .map(|f| f.value);
    Some(StreamEvent::Fragment { name, file_path })
}

fn parse_value(value: &Value) -> Vec<StreamEvent> {
    match value.get("type").and_then(Value::as_str) {
        Some("stream_event") => value.get("event").map(parse_value).unwrap_or_default(),
        Some("content_block_start") => {
            let index = value.get("index").and_then(Value::as_u64);
            let block = value.get("content_block");
            if block.and_then(|b| b.get("type")).and_then(Value::as_str) != Some("tool_use") {
                return Vec::new();
            }
            let name = block
                .and_then(|b| b.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let file_path = block.and_then(|b| b.get("input")).and_then(input_file_path);
            vec![StreamEvent::ToolUseStart { index, name, file_path }]
        }
        Some("content_block_delta") => {
            let index = value.get("index").and_then(Value::as_u64);
            value
                .get("delta")
                .and_then(|d| d.get("partial_json"))
                .and_then(Value::as_str)
                .map(|partial| StreamEvent::ToolInputDelta {
                    index,
                    partial_json: partial.to_string(),
                })
                .into_iter()
                .collect()
        }
        Some("content_block_stop") => vec![StreamEvent::BlockStop {
            index: value.get("index").and_then(Value::as_u64),
        }],
        Some("assistant") => value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .map(|content| {
                content
                    .iter()
                    .filter(|c| c.get("type").and_then(Value::as_str) == Some("tool_use"))
                    .map(|c| StreamEvent::ToolUse {
                        name: c
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        file_path: c.get("input").and_then(input_file_path),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Some("result") => vec![StreamEvent::Result {
            is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            text: value
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: value.get("usage").map(parse_usage),
        }],
        _ => Vec::new(),
    }
}

fn input_file_path(input: &Value) -> Option<String> {
    input
        .get("file_path")
        .or_else(|| input.get("notebook_path"))
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let count = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input: count("input_tokens"),
        output: count("output_tokens"),
        cache_read: count("cache_read_input_tokens"),
        cache_creation: count("cache_creation_input_tokens"),
    }
}
