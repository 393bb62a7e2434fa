//! Tool registry and the bridge the Stage-4 executor dispatches through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod bridge;
pub mod builtins;
pub mod catalog;

pub use bridge::ToolsBridge;
pub use catalog::{load_tool_catalog, merge_tool_catalogs};

/// JSON arguments for one tool call, as parsed from a `[TOOL_CALL]` block.
pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: &str, description: &str) -> Self {
        Self { name: name.to_string(), description: description.to_string(), required: true }
    }

    pub fn optional(name: &str, description: &str) -> Self {
        Self { name: name.to_string(), description: description.to_string(), required: false }
    }
}

/// Static metadata about a tool, surfaced in the tool catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

/// The result returned after a tool runs.  Output is always a string; tools
/// serialize structured data to text before returning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into(), error: None }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, output: String::new(), error: Some(error.into()) }
    }
}

/// Trait implemented by every tool.  Tools receive the bridge so they can
/// reach shared state (HTTP client, interpreter namespace, sandbox).
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn call(&self, bridge: &ToolsBridge, args: &ToolArgs) -> ToolResult;
}

/// Registry mapping tool names to implementations.  Registration is
/// additive; construct one registry per bridge (no process-wide singleton,
/// so tests never order-interfere).
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(builtins::WebSearchTool));
        registry.register(Box::new(builtins::WebScrapeTool));
        registry.register(Box::new(builtins::CodeInterpreterTool));
        registry.register(Box::new(builtins::CalculateTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.spec().name == name).map(|t| t.as_ref())
    }

    pub fn list_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.spec().name).collect()
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }
}

/// String-keyed argument lookup helpers shared by the builtins.
pub(crate) fn arg_str<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

pub(crate) fn arg_usize(args: &ToolArgs, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(|v| {
            v.as_u64().map(|n| n as usize).or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(default)
}

/// `fallback_queries` may be a single string or an array of strings.
pub(crate) fn arg_string_list(args: &ToolArgs, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    /// Minimal dummy tool for testing the registry.
    struct DummyTool {
        name: String,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                description: format!("Dummy tool: {}", self.name),
                params: vec![ToolParam::required("input", "test param")],
            }
        }

        async fn call(&self, _bridge: &ToolsBridge, _args: &ToolArgs) -> ToolResult {
            ToolResult::ok(format!("ran {}", self.name))
        }
    }

    #[test]
    fn empty_registry() {
        let registry = ToolRegistry::new();
        assert!(registry.list_names().is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(DummyTool { name: "alpha".into() }));
        registry.register(Box::new(DummyTool { name: "beta".into() }));

        assert!(registry.get("alpha").is_some());
        assert!(registry.get("beta").is_some());
        assert!(registry.get("gamma").is_none());
    }

    #[test]
    fn builtins_are_present() {
        let registry = ToolRegistry::with_builtins();
        for name in ["web_search", "web_scrape", "code_interpreter", "calculate"] {
            assert!(registry.get(name).is_some(), "missing builtin {name}");
        }
    }

    /// Duplicate registration: the first tool wins on `get` (Vec + find).
    #[test]
    fn duplicate_name_get_returns_first_registered() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(DummyTool { name: "dup".into() }));
        registry.register(Box::new(DummyTool { name: "dup".into() }));

        let dup_count = registry.list_names().iter().filter(|n| *n == "dup").count();
        assert_eq!(dup_count, 2);
        assert!(registry.get("dup").is_some());
    }

    #[test]
    fn arg_helpers_coerce_shapes() {
        let args: ToolArgs = serde_json::from_str(
            r#"{"query":"q","max_results":"7","fallback_queries":["a","","b"],"single":"s"}"#,
        )
        .unwrap();
        assert_eq!(arg_str(&args, "query"), Some("q"));
        assert_eq!(arg_usize(&args, "max_results", 5), 7);
        assert_eq!(arg_usize(&args, "missing", 5), 5);
        assert_eq!(arg_string_list(&args, "fallback_queries"), vec!["a", "b"]);
        assert_eq!(arg_string_list(&args, "single"), vec!["s"]);
        assert!(arg_string_list(&args, "missing").is_empty());
    }
}
