//! The Watcher: a supervisory agent that may rewrite the live plan after
//! each tool result.
//!
//! Best-effort by contract: every failure is reported as an error for the
//! caller to log and swallow; the tool loop never aborts because of the
//! Watcher.

use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;

use anyhow::Result;
use regex::{Regex, RegexBuilder};

use formflow_form::anchors::WATCHER_AUDIT;
use formflow_form::store::{read_live_plan, update_live_plan, update_section};
use formflow_llm::{ChatMessage, ChatModel};
use formflow_memory::create_watcher_audit_context;
use formflow_tools::ToolArgs;

use crate::base::{AgentCore, load_prompt};

const OUTPUT_PREVIEW_CHARS: usize = 2_000;

static PLAN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"```plan\s*(.*?)\s*```")
        .dot_matches_new_line(true)
        .build()
        .expect("plan fence pattern is valid")
});

pub struct WatcherAgent {
    core: AgentCore,
}

impl WatcherAgent {
    pub fn new(model: Arc<dyn ChatModel>, prompts_dir: Option<&Path>) -> Self {
        let prompt = prompts_dir.and_then(|dir| load_prompt(&dir.join("watcher.md")));
        Self { core: AgentCore::new(model, prompt) }
    }

    /// Review one tool result against the live plan.  Returns `true` when
    /// the plan was rewritten.
    #[allow(clippy::too_many_arguments)]
    pub async fn revise_plan(
        &self,
        document: &Path,
        tool_name: &str,
        tool_args: &ToolArgs,
        tool_output: &str,
        tool_error: Option<&str>,
        objective: Option<&str>,
        context_snapshot: Option<&str>,
    ) -> Result<bool> {
        let current_plan = read_live_plan(document)?.unwrap_or_default();
        if current_plan.trim().is_empty() || current_plan.trim() == formflow_form::PLACEHOLDER {
            return Ok(false);
        }

        let audit_context = create_watcher_audit_context(document, objective.unwrap_or(""));
        let request = build_revision_request(
            &current_plan,
            tool_name,
            tool_args,
            tool_output,
            tool_error,
            objective,
            context_snapshot,
            &audit_context,
        );

        let mut messages = self.core.base_messages();
        messages.push(ChatMessage::user(request));
        let response_text = self.core.invoke_messages(&messages).await?;

        let Some(revised) = extract_revised_plan(&response_text) else {
            return Ok(false);
        };
        // An empty fence must never wipe a populated plan.
        if revised.is_empty() || revised.trim() == current_plan.trim() {
            return Ok(false);
        }

        update_live_plan(document, &revised)?;
        update_section(
            document,
            WATCHER_AUDIT,
            &format!("Last revision for tool: {tool_name}\n\n{response_text}"),
            Some("## Watcher Audit Report"),
        )?;
        Ok(true)
    }
}

#[allow(clippy::too_many_arguments)]
fn build_revision_request(
    current_plan: &str,
    tool_name: &str,
    tool_args: &ToolArgs,
    tool_output: &str,
    tool_error: Option<&str>,
    objective: Option<&str>,
    context_snapshot: Option<&str>,
    audit_context: &str,
) -> String {
    let mut sections = vec!["# Plan Revision Request".to_string()];

    if let Some(objective) = objective.filter(|o| !o.trim().is_empty()) {
        sections.push(format!("\n## Objective\n{}", objective.trim()));
    }

    sections.push(format!("\n## Current Live Plan\n```\n{current_plan}\n```"));

    sections.push("\n## Tool Execution Result".to_string());
    sections.push(format!("- Tool: {tool_name}"));
    let args_json = serde_json::to_string(&serde_json::Value::Object(tool_args.clone()))
        .unwrap_or_else(|_| "{}".to_string());
    sections.push(format!("- Args: {args_json}"));

    let mut preview: String = tool_output.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    if tool_output.chars().count() > OUTPUT_PREVIEW_CHARS {
        preview.push_str("... [truncated]");
    }
    sections.push(format!("- Output: {preview}"));

    if let Some(error) = tool_error {
        sections.push(format!("- Error: {error}"));
    }

    if !audit_context.trim().is_empty() {
        sections.push(format!("\n## Audit Context\n{audit_context}"));
    }

    if let Some(snapshot) = context_snapshot.filter(|s| !s.trim().is_empty()) {
        sections.push(format!("\n## Context\n{}", snapshot.trim()));
    }

    sections.push(
        "\n## Your Task\n\n\
         Analyze the tool result and decide if the plan needs revision.\n\n\
         If the tool execution failed or returned inadequate results:\n\
         1. Diagnose the root cause\n\
         2. Revise the current step in the plan with corrected parameters/approach\n\
         3. Output the COMPLETE revised plan\n\n\
         If the tool execution succeeded:\n\
         1. Mark the current step as completed\n\
         2. Ensure the next step is ready for execution\n\
         3. Output the COMPLETE plan (with status updates)\n\n\
         ## Output Format\n\n\
         Output ONLY the revised plan in this exact format:\n\n\
         ```plan\n[Your complete revised plan here, with step statuses]\n```\n\n\
         If NO revision is needed, output:\n\
         ```plan\nNO_CHANGE\n```"
            .to_string(),
    );

    sections.join("\n")
}

/// The ```plan fenced block, or `None` for `NO_CHANGE` / missing fences.
fn extract_revised_plan(response_text: &str) -> Option<String> {
    let content = PLAN_FENCE.captures(response_text)?.get(1)?.as_str().trim().to_string();
    if content == "NO_CHANGE" { None } else { Some(content) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::testing::MockModel;
    use formflow_form::store::read_section;
    use serde_json::json;
    use std::io::Write as _;

    fn form_with_plan(plan: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "<!-- LIVE_EXECUTION_PLAN_START -->\n{plan}\n<!-- LIVE_EXECUTION_PLAN_END -->\n\
             <!-- WATCHER_AUDIT_START -->\n`待填写`\n<!-- WATCHER_AUDIT_END -->\n"
        )
        .unwrap();
        file
    }

    fn args() -> ToolArgs {
        let mut args = ToolArgs::new();
        args.insert("query".to_string(), json!("x"));
        args
    }

    #[tokio::test]
    async fn revision_overwrites_plan_and_audit() {
        let form = form_with_plan("Objective: x\n\n## Steps\n\n1. old step");
        let model = Arc::new(MockModel::scripted(&[
            "diagnosis text\n```plan\nObjective: x\n\n## Steps\n\n1. revised step\n```",
        ]));
        let watcher = WatcherAgent::new(model, None);

        let revised = watcher
            .revise_plan(form.path(), "web_search", &args(), "", Some("timeout"), Some("x"), None)
            .await
            .unwrap();
        assert!(revised);

        let plan = read_live_plan(form.path()).unwrap().unwrap();
        assert!(plan.contains("1. revised step"));

        let audit = read_section(form.path(), WATCHER_AUDIT).unwrap().unwrap();
        assert!(audit.starts_with("Last revision for tool: web_search"));
        assert!(audit.contains("diagnosis text"));
    }

    #[tokio::test]
    async fn no_change_leaves_document_untouched() {
        let form = form_with_plan("Objective: x\n\n## Steps\n\n1. step");
        let model = Arc::new(MockModel::scripted(&["```plan\nNO_CHANGE\n```"]));
        let watcher = WatcherAgent::new(model, None);

        let revised = watcher
            .revise_plan(form.path(), "calculate", &args(), "4", None, None, None)
            .await
            .unwrap();
        assert!(!revised);
        assert!(
            read_section(form.path(), WATCHER_AUDIT).unwrap().unwrap().contains("待填写")
        );
    }

    #[tokio::test]
    async fn identical_plan_is_not_a_revision() {
        let plan = "Objective: x\n\n## Steps\n\n1. step";
        let form = form_with_plan(plan);
        let reply = format!("```plan\n{plan}\n```");
        let model = Arc::new(MockModel::scripted(&[reply.as_str()]));
        let watcher = WatcherAgent::new(model, None);

        let revised =
            watcher.revise_plan(form.path(), "calculate", &args(), "4", None, None, None).await.unwrap();
        assert!(!revised);
    }

    #[tokio::test]
    async fn empty_plan_fence_never_wipes_the_plan() {
        let plan = "Objective: x\n\n## Steps\n\n1. step";
        let form = form_with_plan(plan);
        let model = Arc::new(MockModel::scripted(&["```plan\n\n```"]));
        let watcher = WatcherAgent::new(model, None);

        let revised =
            watcher.revise_plan(form.path(), "calculate", &args(), "4", None, None, None).await.unwrap();
        assert!(!revised);
        assert_eq!(read_live_plan(form.path()).unwrap().unwrap(), plan);
    }

    #[tokio::test]
    async fn empty_live_plan_short_circuits() {
        let form = form_with_plan("`待填写`");
        let model = Arc::new(MockModel::scripted(&[]));
        let watcher = WatcherAgent::new(model, None);
        let revised =
            watcher.revise_plan(form.path(), "calculate", &args(), "4", None, None, None).await.unwrap();
        assert!(!revised);
    }

    #[test]
    fn fence_extraction_handles_variants() {
        assert_eq!(
            extract_revised_plan("before\n```plan\nnew plan\n```\nafter").as_deref(),
            Some("new plan")
        );
        assert_eq!(extract_revised_plan("```plan\nNO_CHANGE\n```"), None);
        assert_eq!(extract_revised_plan("no fence at all"), None);
    }
}
