//! Tool call extraction from LLM response text
//!
//! Model output is noisy: tool calls arrive embedded in prose, inside fenced
//! code blocks, or not at all while the reasoning text describes one. This
//! module pulls `{"name": ..., "arguments": {...}}` envelopes out of that
//! noise with a balanced-brace scan, and offers an explicitly lower-confidence
//! regex fallback that infers a small fixed set of calls from `<think>` spans.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::ToolCall;

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("Invalid think tag regex"));

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)```").expect("Invalid fence regex"));

static THINK_CAPTURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>(.*?)</think>").expect("Invalid think tag regex"));

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)(?:file_path|path is|path to|filename is|save to)\s*['"](.+?)['"]"#)
        .expect("Invalid path regex")
});

static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)(?:text is|text to|set text to|content is|with content)\s*['"](.+?)['"]"#)
        .expect("Invalid text regex")
});

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:file path is|save to|filename is|path is)\s*['"]([^'"\s]+)['"]"#)
        .expect("Invalid file regex")
});

/// The textual envelope: exactly `name` and `arguments`, nothing else
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    name: String,
    arguments: Map<String, Value>,
}

/// Extracts structured tool calls from raw model output
#[derive(Debug, Default)]
pub struct ToolCallExtractor;

impl ToolCallExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract all tool calls from the given text.
    ///
    /// `<think>` spans are stripped first so in-progress reasoning can never
    /// be mistaken for a call. Fenced code blocks are preferred; the whole
    /// filtered text is scanned only when no block yielded a call.
    pub fn extract(&self, text: &str) -> Vec<ToolCall> {
        let filtered = THINK_RE.replace_all(text, "");
        let mut calls = Vec::new();

        for block in FENCE_RE.captures_iter(&filtered) {
            for candidate in find_balanced_objects(&block[1]) {
                if let Some(call) = parse_envelope(candidate) {
                    calls.push(call);
                }
            }
        }

        if calls.is_empty() {
            for candidate in find_balanced_objects(&filtered) {
                if let Some(call) = parse_envelope(candidate) {
                    calls.push(call);
                }
            }
        }

        if calls.is_empty() {
            tracing::debug!(
                chars = filtered.len(),
                "No tool calls found after filtering think spans"
            );
        } else {
            for call in &calls {
                tracing::debug!(tool = %call.name, "Extracted tool call");
            }
        }

        calls
    }

    /// Best-effort inference of tool calls from a `<think>` span.
    ///
    /// Limited to an enumerated tool set (`create_document`, `set_text`,
    /// `save_file`) and quoted values following phrases like "text is" /
    /// "path is". Results are logged as inferred so telemetry can always
    /// tell them apart from structured extraction.
    pub fn infer_from_reasoning(&self, text: &str) -> Vec<ToolCall> {
        let Some(thinking) = THINK_CAPTURE_RE
            .captures(text)
            .map(|c| c[1].to_string())
        else {
            return Vec::new();
        };
        let thinking_lower = thinking.to_lowercase();

        let mut calls = Vec::new();

        if thinking_lower.contains("create_document") {
            if let (Some(path), Some(body)) =
                (PATH_RE.captures(&thinking), TEXT_RE.captures(&thinking))
            {
                let mut arguments = Map::new();
                arguments.insert("file_path".to_string(), Value::String(path[1].to_string()));
                arguments.insert("text".to_string(), Value::String(body[1].to_string()));
                tracing::info!(
                    tool = "create_document",
                    "Inferred tool call from reasoning text (low confidence)"
                );
                calls.push(ToolCall::new("create_document", arguments));
            }
        }

        if calls.is_empty() {
            if ["set_text", "set text", "set", "text"]
                .iter()
                .any(|k| thinking_lower.contains(k))
            {
                if let Some(body) = TEXT_RE.captures(&thinking) {
                    let mut arguments = Map::new();
                    arguments.insert("text".to_string(), Value::String(body[1].to_string()));
                    tracing::info!(
                        tool = "set_text",
                        "Inferred tool call from reasoning text (low confidence)"
                    );
                    calls.push(ToolCall::new("set_text", arguments));
                }
            }

            if ["save_file", "save file", "save", "file"]
                .iter()
                .any(|k| thinking_lower.contains(k))
            {
                if let Some(file) = FILE_RE.captures(&thinking) {
                    let mut arguments = Map::new();
                    arguments.insert("file_path".to_string(), Value::String(file[1].to_string()));
                    tracing::info!(
                        tool = "save_file",
                        "Inferred tool call from reasoning text (low confidence)"
                    );
                    calls.push(ToolCall::new("save_file", arguments));
                }
            }
        }

        calls
    }
}

/// Parse a candidate substring as the strict tool-call envelope.
fn parse_envelope(candidate: &str) -> Option<ToolCall> {
    let envelope: Envelope = serde_json::from_str(candidate).ok()?;
    Some(ToolCall::new(envelope.name, envelope.arguments))
}

/// Find complete `{...}` object substrings with a balanced-brace scan.
///
/// Quoted spans are treated as opaque (honoring backslash escapes) so braces
/// inside string literals never affect nesting depth. Candidates are
/// pre-filtered on the cheap textual presence of `"name"` and `"arguments"`
/// before any JSON parsing happens.
fn find_balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut results = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                // Skip over string contents, honoring escapes
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == b'"' {
                        break;
                    }
                    i += 1;
                }
            }
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            let candidate = &text[s..=i];
                            if candidate.contains("\"name\"")
                                && candidate.contains("\"arguments\"")
                            {
                                results.push(candidate);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    results
}
