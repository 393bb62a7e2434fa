//! Stage 4: tool-driven execution against the live plan.
//!
//! The loop reads the live plan from the document each iteration, asks the
//! model to execute the next pending step, dispatches any `[TOOL_CALL]`
//! blocks in document order, feeds `[TOOL_RESULT]` messages back, logs each
//! call into the execution-log anchor, and lets the Watcher revise the plan
//! after every result.  When the iteration ceiling is hit with the model
//! still asking for tools, one forced finalization prompt extracts the
//! final answer.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use formflow_form::orchestrator::DocumentOrchestrator;
use formflow_form::store::{read_live_plan, update_live_plan};
use formflow_llm::{ChatMessage, ChatModel};
use formflow_tools::ToolsBridge;

use crate::base::{AgentCore, extract_section, load_prompt};
use crate::parser::{format_tool_result, parse_tool_calls};
use crate::watcher::WatcherAgent;

pub const FINAL_ANSWER_SENTINEL: &str =
    "[FINAL_ANSWER_REQUIRED] Output your Final Answer now. No more tool calls.";

/// The executor prompt file may carry a trailing reflection template; only
/// the part above this marker is the system prompt.
const PROMPT_END_MARKER: &str = "<!-- REFLECTION_TEMPLATE_START -->";

pub struct Stage4ExecutorAgent {
    core: AgentCore,
    max_iterations: usize,
}

impl Stage4ExecutorAgent {
    pub fn new(model: Arc<dyn ChatModel>, prompts_dir: Option<&Path>, max_iterations: usize) -> Self {
        let prompt = prompts_dir
            .and_then(|dir| load_prompt(&dir.join("stage4.md")))
            .map(|content| match content.find(PROMPT_END_MARKER) {
                Some(idx) => content[..idx].trim().to_string(),
                None => content,
            })
            .filter(|content| !content.is_empty());
        Self { core: AgentCore::new(model, prompt), max_iterations }
    }

    /// Plain single-shot analysis, for runs without the tool loop.
    pub async fn analyze(&self, context: &str) -> Result<String> {
        Ok(self.core.invoke(context).await?)
    }

    /// Run the live-document tool loop.  Returns the final answer text.
    pub async fn execute(
        &self,
        context: &str,
        bridge: &ToolsBridge,
        watcher: Option<&WatcherAgent>,
        orchestrator: &DocumentOrchestrator,
    ) -> Result<String> {
        let document = orchestrator.document_path();
        let objective = extract_section(context, "Objective");
        let context_snapshot = extract_section(context, "Context Snapshot");
        let execution_plan = extract_section(context, "Stage 3 Plan");

        self.seed_live_plan(document, &objective, &execution_plan)?;

        let mut messages = self.core.base_messages();
        let mut iteration = 0usize;
        let mut last_response = String::new();

        info!(max = self.max_iterations, "starting live document execution loop");

        while iteration < self.max_iterations {
            iteration += 1;
            info!(iteration, max = self.max_iterations, "tool loop iteration");

            let live_plan = read_live_plan(document)?.unwrap_or_default();
            messages.push(ChatMessage::user(build_iteration_prompt(&live_plan, iteration)));

            let response_text = self.core.invoke_messages(&messages).await?;
            messages.push(ChatMessage::assistant(response_text.clone()));
            last_response = response_text;

            let tool_calls = parse_tool_calls(&last_response);
            if tool_calls.is_empty() {
                info!("no tool calls found, ending loop");
                break;
            }
            info!(count = tool_calls.len(), "parsed tool calls");

            for call in tool_calls {
                let result = bridge.call_tool(&call.tool, &call.args).await;
                info!(
                    tool = %call.tool,
                    success = result.success,
                    output_len = result.output.len(),
                    "tool result"
                );

                messages.push(ChatMessage::user(format_tool_result(&call, &result)));
                orchestrator.register_tool_call(
                    iteration,
                    &call.tool,
                    &Value::Object(call.args.clone()),
                    &result.output,
                    result.error.as_deref(),
                )?;

                if let Some(watcher) = watcher {
                    match watcher
                        .revise_plan(
                            document,
                            &call.tool,
                            &call.args,
                            &result.output,
                            result.error.as_deref(),
                            Some(&objective),
                            Some(&context_snapshot),
                        )
                        .await
                    {
                        Ok(true) => info!(tool = %call.tool, "watcher revised the live plan"),
                        Ok(false) => {}
                        // The supervisor must never break the supervised loop.
                        Err(err) => warn!(error = %err, "watcher revision failed"),
                    }
                }
            }
        }

        info!(iteration, "tool loop ended");

        // Forced finalization: the ceiling was hit mid-tool-use, or the
        // ceiling was zero and no reply exists at all.
        if iteration == 0 || !parse_tool_calls(&last_response).is_empty() {
            messages.push(ChatMessage::user(FINAL_ANSWER_SENTINEL));
            last_response = self.core.invoke_messages(&messages).await?;
        }

        Ok(last_response)
    }

    fn seed_live_plan(&self, document: &Path, objective: &str, plan: &str) -> Result<()> {
        let header =
            if objective.is_empty() { String::new() } else { format!("Objective: {objective}\n\n") };
        let initial = format!("{header}## Steps\n\n{plan}");
        update_live_plan(document, &initial)?;
        Ok(())
    }
}

fn build_iteration_prompt(live_plan: &str, iteration: usize) -> String {
    format!(
        "# Current Live Plan (Iteration {iteration})\n\n\
         Read the plan below and execute the next pending step.\n\n\
         ```plan\n{live_plan}\n```\n\n\
         Execute the next step by outputting a [TOOL_CALL] block, or output Final Answer if done."
    )
}
