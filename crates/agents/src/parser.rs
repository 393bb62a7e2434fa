//! `[TOOL_CALL]` block parsing and `[TOOL_RESULT]` rendering.
//!
//! Grammar: an assistant reply may contain any number of
//! `[TOOL_CALL] ... [/TOOL_CALL]` blocks, each a sequence of `key: value`
//! lines.  `tool:` names the target; other recognized keys become args.
//! `code:` collects following lines until the next recognized top-level key
//! (or a column-zero `identifier:` line) so multi-line snippets survive.
//! Malformed blocks (no closing sentinel, no `tool:`) contribute nothing.

use serde_json::Value;

use formflow_tools::{ToolArgs, ToolResult};

pub const OPEN_SENTINEL: &str = "[TOOL_CALL]";
pub const CLOSE_SENTINEL: &str = "[/TOOL_CALL]";

/// Keys that terminate a `code:` block when they start a line.  Adding a
/// tool with new argument names means extending this set.  `code` itself is
/// deliberately absent: an indented `code:` line inside a snippet is snippet
/// content, and a bare one already terminates via the unindented-identifier
/// fallback.
const TOP_LEVEL_KEYS: &[&str] = &[
    "tool",
    "query",
    "url",
    "format",
    "expression",
    "max_results",
    "provider",
    "fallback_queries",
    "min_results",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub tool: String,
    pub args: ToolArgs,
}

/// Parse every well-formed tool-call block, in document order.  Parsing is
/// pure and idempotent: the same text always yields the same list.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for segment in text.split(OPEN_SENTINEL).skip(1) {
        let Some((body, _)) = segment.split_once(CLOSE_SENTINEL) else {
            continue;
        };
        let lines: Vec<&str> = body.trim().lines().collect();
        let mut tool_name = String::new();
        let mut args = ToolArgs::new();

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            let stripped = line.trim();
            let Some((key, value)) = stripped.split_once(':') else {
                i += 1;
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "tool" => {
                    tool_name = value.to_string();
                    i += 1;
                }
                "code" => {
                    let (code, next) = collect_code_block(&lines, i, value);
                    args.insert("code".to_string(), Value::String(code));
                    i = next;
                }
                _ => {
                    args.insert(key.to_string(), parse_value(value));
                    i += 1;
                }
            }
        }

        if !tool_name.is_empty() {
            calls.push(ToolCall { tool: tool_name, args });
        }
    }
    calls
}

/// Gather the lines belonging to a `code:` key starting at `start`.
/// Returns the dedented snippet and the index of the first line after it.
fn collect_code_block(lines: &[&str], start: usize, inline_value: &str) -> (String, usize) {
    let mut code_lines: Vec<String> = Vec::new();
    if !inline_value.is_empty() {
        // A quoted single-line snippet may arrive as a JSON string.
        match serde_json::from_str::<Value>(inline_value) {
            Ok(Value::String(snippet)) => code_lines.push(snippet),
            _ => code_lines.push(inline_value.to_string()),
        }
    }

    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        let stripped = line.trim();
        if stripped.is_empty() {
            code_lines.push(String::new());
            i += 1;
            continue;
        }
        if let Some((candidate, _)) = stripped.split_once(':') {
            let candidate = candidate.trim();
            if TOP_LEVEL_KEYS.contains(&candidate) {
                break;
            }
            if !line.starts_with([' ', '\t']) && is_identifier(candidate) {
                break;
            }
        }
        code_lines.push(line.trim_end().to_string());
        i += 1;
    }

    (dedent(&code_lines.join("\n")).trim().to_string(), i)
}

/// Values that parse as JSON are stored parsed; everything else stays raw.
fn parse_value(value: &str) -> Value {
    serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn is_identifier(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn dedent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    code.lines()
        .map(|line| if line.len() >= indent { &line[indent..] } else { line.trim_start() })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a tool result as the `[TOOL_RESULT]` user message fed back to the
/// model.
pub fn format_tool_result(call: &ToolCall, result: &ToolResult) -> String {
    let mut parts = vec!["[TOOL_RESULT]".to_string(), format!("tool: {}", call.tool)];
    if !result.output.is_empty() {
        parts.push(format!("output: {}", result.output));
    }
    if let Some(error) = &result.error {
        parts.push(format!("error: {error}"));
    }
    parts.join("\n")
}
