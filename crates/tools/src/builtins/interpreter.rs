//! Persistent code interpreter.
//!
//! Each call runs in a fresh sandboxed subprocess, but the namespace
//! survives: the bridge carries an explicit state bag of JSON-serializable
//! bindings that is injected before the snippet and re-captured afterwards.
//! Bindings the interpreter cannot serialize (functions, open handles) do
//! not survive the round trip.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use formflow_exec::IsolationLevel;

use crate::bridge::ToolsBridge;
use crate::{Tool, ToolArgs, ToolParam, ToolResult, ToolSpec, arg_str};

/// Sentinel line separating user stdout from the exported namespace.
const NAMESPACE_MARKER: &str = "___INTERPRETER_NS___";

/// Conventional result bindings, scanned in order after execution.
const RESULT_KEYS: &[&str] = &["_result_", "result", "answer"];

pub struct CodeInterpreterTool;

#[async_trait]
impl Tool for CodeInterpreterTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "code_interpreter".to_string(),
            description: "Run a code snippet with a namespace that persists across calls."
                .to_string(),
            params: vec![ToolParam::required("code", "The snippet to execute")],
        }
    }

    async fn call(&self, bridge: &ToolsBridge, args: &ToolArgs) -> ToolResult {
        let code = arg_str(args, "code").map(dedent).unwrap_or_default();
        if code.trim().is_empty() {
            return ToolResult::fail("code_interpreter received empty code snippet");
        }

        let namespace = bridge.interpreter().lock().await.namespace.clone();
        let script = compose_script(&code, &namespace);

        let outcome = bridge.sandbox().execute(&script, IsolationLevel::High).await;
        if !outcome.success {
            let mut error_parts = Vec::new();
            let (user_output, _) = split_namespace(&outcome.output);
            if !user_output.trim().is_empty() {
                error_parts.push(format!("--- Stdout before error ---\n{}", user_output.trim()));
            }
            error_parts
                .push(outcome.error.unwrap_or_else(|| "interpreter execution failed".to_string()));
            return ToolResult::fail(error_parts.join("\n"));
        }

        let (user_output, exported) = split_namespace(&outcome.output);
        let result_value = exported.as_ref().and_then(|ns| {
            RESULT_KEYS.iter().find_map(|key| ns.get(*key)).filter(|v| !v.is_null()).cloned()
        });
        if let Some(exported) = exported {
            bridge.interpreter().lock().await.namespace = exported;
        }

        let mut parts = Vec::new();
        if !user_output.trim().is_empty() {
            parts.push(user_output.trim().to_string());
        }
        if let Some(value) = result_value {
            parts.push(format!("Return: {}", display_value(&value)));
        }
        if parts.is_empty() {
            parts.push("Executed with no output".to_string());
        }
        ToolResult::ok(parts.join("\n"))
    }
}

/// Wrap the snippet with namespace injection and re-export.
fn compose_script(code: &str, namespace: &HashMap<String, Value>) -> String {
    let injected = serde_json::to_string(&namespace)
        .unwrap_or_else(|_| "{}".to_string())
        // Keep the payload safe inside the triple-quoted literal.  The
        // escape only ever lands inside JSON strings.
        .replace('\\', "\\\\")
        .replace('\'', "\\u0027");

    format!(
        "import json as _json\n\
         _ns = _json.loads('''{injected}''')\n\
         globals().update(_ns)\n\
         del _ns\n\
         {code}\n\
         _exportable = {{}}\n\
         for _k in list(globals().keys()):\n\
         \x20   if _k.startswith('__') or _k in ('_json', '_k', '_v', '_exportable'):\n\
         \x20       continue\n\
         \x20   _v = globals()[_k]\n\
         \x20   if _v is None or isinstance(_v, (int, float, str, bool, list, dict)):\n\
         \x20       _exportable[_k] = _v\n\
         print('{NAMESPACE_MARKER}' + _json.dumps(_exportable))\n"
    )
}

/// Split captured stdout into the user-visible part and the exported
/// namespace (when the sentinel made it out before truncation).
fn split_namespace(stdout: &str) -> (String, Option<HashMap<String, Value>>) {
    match stdout.find(NAMESPACE_MARKER) {
        None => (stdout.to_string(), None),
        Some(pos) => {
            let user = stdout[..pos].to_string();
            let payload = stdout[pos + NAMESPACE_MARKER.len()..]
                .lines()
                .next()
                .unwrap_or_default()
                .trim();
            let parsed = serde_json::from_str::<HashMap<String, Value>>(payload).ok();
            (user, parsed)
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strip the common leading indentation the model tends to emit inside
/// `code:` blocks.
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
