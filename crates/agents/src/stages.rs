//! Stages 1–3: thin wrappers binding prompts and stage I/O conventions.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use formflow_llm::ChatModel;
use formflow_tools::{ToolArgs, ToolsBridge};

use crate::base::{AgentCore, extract_section, load_prompt, prompt_with_library_dir};

// ── Stage 1: metacognitive analysis ──────────────────────────────────────────

/// Analyzes the objective for hidden assumptions and failure modes.  The
/// system prompt is augmented with the ability library, and an optional
/// research pre-pass feeds external failure-mode findings into the context.
pub struct MetacognitiveAnalysisAgent {
    core: AgentCore,
}

impl MetacognitiveAnalysisAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        prompts_dir: Option<&Path>,
        ability_library_dir: Option<&Path>,
    ) -> Self {
        let prompt = prompts_dir.and_then(|dir| load_prompt(&dir.join("stage1.md")));
        let prompt = match ability_library_dir {
            Some(dir) => prompt_with_library_dir(prompt, dir, "Ability Library"),
            None => prompt,
        };
        Self { core: AgentCore::new(model, prompt) }
    }

    /// `research_bridge` enables the failure-mode search pre-pass; research
    /// failures never block the analysis.
    pub async fn analyze(
        &self,
        context: &str,
        research_bridge: Option<&ToolsBridge>,
    ) -> Result<String> {
        let mut user_content = context.trim().to_string();

        if let Some(bridge) = research_bridge {
            let objective = extract_section(context, "Objective");
            if !objective.is_empty() {
                match self.failure_mode_research(bridge, &objective).await {
                    Some(findings) => {
                        info!("failure-mode research appended to stage 1 context");
                        user_content
                            .push_str(&format!("\n\n## External Failure Mode Research\n\n{findings}"));
                    }
                    None => warn!("failure-mode research yielded nothing usable"),
                }
            }
        }

        Ok(self.core.invoke(&user_content).await?)
    }

    async fn failure_mode_research(&self, bridge: &ToolsBridge, objective: &str) -> Option<String> {
        let mut args = ToolArgs::new();
        args.insert("query".to_string(), json!(format!("common failure modes when {objective}")));
        args.insert("max_results".to_string(), json!(3));
        let result = bridge.call_tool("web_search", &args).await;
        if !result.success || result.output.trim().is_empty() {
            return None;
        }
        Some(result.output)
    }
}

// ── Stage 2-A: candidate strategy enumeration ────────────────────────────────

pub struct CandidateStrategyAgent {
    core: AgentCore,
}

impl CandidateStrategyAgent {
    pub fn new(model: Arc<dyn ChatModel>, prompts_dir: Option<&Path>) -> Self {
        let prompt = prompts_dir.and_then(|dir| load_prompt(&dir.join("stage2a.md")));
        Self { core: AgentCore::new(model, prompt) }
    }

    pub async fn analyze(&self, context: &str, candidate_limit: Option<usize>) -> Result<String> {
        let mut user_content = context.trim().to_string();
        if let Some(limit) = candidate_limit {
            user_content
                .push_str(&format!("\n\n## Constraint\n\nEnumerate at most {limit} candidate strategies."));
        }
        Ok(self.core.invoke(&user_content).await?)
    }
}

// ── Stage 2-B: strategy selection ────────────────────────────────────────────

pub struct StrategySelectionAgent {
    core: AgentCore,
}

impl StrategySelectionAgent {
    pub fn new(model: Arc<dyn ChatModel>, prompts_dir: Option<&Path>) -> Self {
        let prompt = prompts_dir.and_then(|dir| load_prompt(&dir.join("stage2b.md")));
        Self { core: AgentCore::new(model, prompt) }
    }

    pub async fn analyze(&self, context: &str) -> Result<String> {
        Ok(self.core.invoke(context).await?)
    }
}

// ── Stage 3: execution planning ──────────────────────────────────────────────

pub struct ExecutionPlanningAgent {
    core: AgentCore,
}

impl ExecutionPlanningAgent {
    pub fn new(model: Arc<dyn ChatModel>, prompts_dir: Option<&Path>) -> Self {
        let prompt = prompts_dir.and_then(|dir| load_prompt(&dir.join("stage3.md")));
        Self { core: AgentCore::new(model, prompt) }
    }

    pub async fn analyze(&self, context: &str) -> Result<String> {
        Ok(self.core.invoke(context).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::testing::MockModel;

    #[tokio::test]
    async fn candidate_limit_is_appended_as_constraint() {
        let model = Arc::new(MockModel::scripted(&["candidates"]));
        let agent = CandidateStrategyAgent::new(model.clone(), None);
        agent.analyze("## Objective (from user_input)\n\nSay hi", Some(3)).await.unwrap();

        let calls = model.calls.lock().unwrap();
        let user = &calls[0].last().unwrap().content;
        assert!(user.contains("at most 3 candidate strategies"));
    }

    #[tokio::test]
    async fn stage1_without_research_uses_context_verbatim() {
        let model = Arc::new(MockModel::scripted(&["analysis"]));
        let agent = MetacognitiveAnalysisAgent::new(model.clone(), None, None);
        let out = agent.analyze("## Objective (from user_input)\n\nSay hi", None).await.unwrap();
        assert_eq!(out, "analysis");

        let calls = model.calls.lock().unwrap();
        assert!(!calls[0].last().unwrap().content.contains("External Failure Mode Research"));
    }

    #[tokio::test]
    async fn stage1_prompt_picks_up_ability_library() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("decomposition.md"), "break problems down").unwrap();
        let model = Arc::new(MockModel::scripted(&["analysis"]));
        let agent = MetacognitiveAnalysisAgent::new(model.clone(), None, Some(dir.path()));
        agent.analyze("## Objective\n\nx", None).await.unwrap();

        let calls = model.calls.lock().unwrap();
        let system = &calls[0][0].content;
        assert!(system.contains("## Ability Library: decomposition"));
        assert!(system.contains("break problems down"));
    }
}
