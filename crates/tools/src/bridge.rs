//! The tool bridge: owns the registry, the HTTP client, the sandbox, and
//! the persistent code-interpreter namespace.
//!
//! One bridge per run.  Two concurrent runs need two bridges; the
//! interpreter namespace is deliberately bridge-local.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use formflow_exec::SandboxExecutor;

use crate::{ToolArgs, ToolRegistry, ToolResult};

/// The interpreter's explicit state bag: variable bindings carried across
/// `code_interpreter` calls.  Values are opaque JSON at this boundary.
#[derive(Debug, Default)]
pub struct InterpreterState {
    pub namespace: HashMap<String, Value>,
}

pub struct ToolsBridge {
    registry: ToolRegistry,
    http: reqwest::Client,
    sandbox: SandboxExecutor,
    interpreter: Mutex<InterpreterState>,
}

impl Default for ToolsBridge {
    fn default() -> Self {
        Self::new(ToolRegistry::with_builtins())
    }
}

impl ToolsBridge {
    pub fn new(registry: ToolRegistry) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            registry,
            http,
            sandbox: SandboxExecutor::default(),
            interpreter: Mutex::new(InterpreterState::default()),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn sandbox(&self) -> &SandboxExecutor {
        &self.sandbox
    }

    pub fn interpreter(&self) -> &Mutex<InterpreterState> {
        &self.interpreter
    }

    /// Clear every binding the interpreter has accumulated.
    pub async fn reset_interpreter(&self) {
        let mut state = self.interpreter.lock().await;
        state.namespace.clear();
        info!("interpreter namespace reset");
    }

    /// Dispatch one tool call.  Unknown tools and in-tool failures are both
    /// reported as failed `ToolResult`s; the conversational loop feeds them
    /// back to the model rather than aborting.
    pub async fn call_tool(&self, tool_name: &str, args: &ToolArgs) -> ToolResult {
        let Some(tool) = self.registry.get(tool_name) else {
            return ToolResult::fail(format!(
                "Unknown tool: {tool_name}. Available: {:?}",
                self.registry.list_names()
            ));
        };
        let args_display = Value::Object(args.clone());
        debug!(tool = tool_name, args = %args_display, "dispatching tool call");
        tool.call(self, args).await
    }
}
