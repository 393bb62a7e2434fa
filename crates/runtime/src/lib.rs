//! Pipeline runner: sequences the five stages and the two upgrade agents
//! around one collaboration form.
//!
//! Stage order is fixed: Stage 1 → Stage 2-A → Stage 2-B → Stage 2-C
//! (strategy upgrade, optional) → Stage 3 → Stage 4 (tool loop) →
//! capability upgrade (optional).  Stage 2-B retries HTTP errors; every
//! other stage failure is logged with a banner and propagated.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use formflow_agents::{
    CandidateStrategyAgent, ExecutionPlanningAgent, MetacognitiveAnalysisAgent,
    Stage4ExecutorAgent, StrategySelectionAgent, UpgradeAgent, WatcherAgent,
};
use formflow_form::anchors::WATCHER_AUDIT;
use formflow_form::orchestrator::{DocumentOrchestrator, StageSlot};
use formflow_form::store::ensure_markers;
use formflow_form::template::{TemplateProvisioner, list_documents, most_recent_document};
use formflow_form::{PLACEHOLDER, RECOGNIZED_ANCHORS};
use formflow_llm::{ChatModel, LlmError};
use formflow_memory::{
    create_stage1_context, create_stage2a_context, create_stage2b_context, create_stage3_context,
    create_stage4_context, load_stage_output,
};
use formflow_tools::builtins::{FIRECRAWL_API_KEY_ENV, TAVILY_API_KEY_ENV};
use formflow_tools::{ToolsBridge, load_tool_catalog};

const STAGE2B_RETRY_ATTEMPTS: usize = 3;
const STAGE2B_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything the runner needs besides the models.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub finish_form_dir: PathBuf,
    pub template_path: PathBuf,
    pub template_threshold: usize,
    pub prompts_dir: Option<PathBuf>,
    pub strategy_library: PathBuf,
    pub capability_library: PathBuf,
    pub strategy_auto_apply: bool,
    pub capability_auto_apply: bool,
    pub watcher_enabled: bool,
    pub candidate_limit: Option<usize>,
    pub max_iterations: usize,
    pub tool_catalog: Option<Vec<String>>,
    pub tool_catalog_path: PathBuf,
    /// Stage-1 failure-mode research pre-pass; silently skipped when no
    /// search provider key is configured.
    pub stage1_research: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            finish_form_dir: PathBuf::from("finish_form"),
            template_path: PathBuf::from("form_templates/standard_template.md"),
            template_threshold: 8,
            prompts_dir: Some(PathBuf::from("prompts")),
            strategy_library: PathBuf::from(formflow_agents::STRATEGY_LIBRARY_FILE),
            capability_library: PathBuf::from(formflow_agents::CAPABILITY_LIBRARY_FILE),
            strategy_auto_apply: true,
            capability_auto_apply: false,
            watcher_enabled: true,
            candidate_limit: None,
            max_iterations: 10,
            tool_catalog: None,
            tool_catalog_path: PathBuf::from(formflow_tools::catalog::DEFAULT_TOOL_CATALOG_PATH),
            stage1_research: true,
        }
    }
}

/// The record a finished run returns to the caller.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub document: PathBuf,
    pub stage1: String,
    pub stage2_candidate: String,
    pub stage2_selection: String,
    pub stage2_upgrade: Option<String>,
    pub stage3: String,
    pub stage4: String,
    pub watcher_audit: Option<String>,
    pub capability_upgrade: Option<String>,
}

pub struct PipelineRunner {
    options: PipelineOptions,
    provisioner: TemplateProvisioner,
    stage1: MetacognitiveAnalysisAgent,
    stage2_candidate: CandidateStrategyAgent,
    stage2_selection: StrategySelectionAgent,
    stage2_upgrade: UpgradeAgent,
    stage3: ExecutionPlanningAgent,
    stage4: Stage4ExecutorAgent,
    capability: UpgradeAgent,
    watcher: Option<WatcherAgent>,
    bridge: ToolsBridge,
}

impl PipelineRunner {
    /// `watcher_model` only matters when the watcher is enabled; it
    /// defaults to the shared model.
    pub fn new(
        model: Arc<dyn ChatModel>,
        watcher_model: Option<Arc<dyn ChatModel>>,
        options: PipelineOptions,
    ) -> Self {
        let prompts = options.prompts_dir.as_deref();
        let ability_dir = options.capability_library.parent().map(Path::to_path_buf);

        let provisioner = TemplateProvisioner::new(
            &options.template_path,
            &options.finish_form_dir,
            options.template_threshold,
        );

        let stage1 =
            MetacognitiveAnalysisAgent::new(Arc::clone(&model), prompts, ability_dir.as_deref());
        let stage2_candidate = CandidateStrategyAgent::new(Arc::clone(&model), prompts);
        let stage2_selection = StrategySelectionAgent::new(Arc::clone(&model), prompts);
        let stage2_upgrade = UpgradeAgent::strategy(
            Arc::clone(&model),
            prompts,
            &options.strategy_library,
            options.strategy_auto_apply,
        );
        let stage3 = ExecutionPlanningAgent::new(Arc::clone(&model), prompts);
        let stage4 = Stage4ExecutorAgent::new(Arc::clone(&model), prompts, options.max_iterations);
        let capability = UpgradeAgent::capability(
            Arc::clone(&model),
            prompts,
            &options.capability_library,
            options.capability_auto_apply,
        );
        let watcher = options
            .watcher_enabled
            .then(|| WatcherAgent::new(watcher_model.unwrap_or(model), prompts));

        Self {
            options,
            provisioner,
            stage1,
            stage2_candidate,
            stage2_selection,
            stage2_upgrade,
            stage3,
            stage4,
            capability,
            watcher,
            bridge: ToolsBridge::default(),
        }
    }

    pub async fn run(
        &mut self,
        objective: &str,
        context_snapshot: Option<&str>,
    ) -> Result<PipelineRun> {
        let tool_catalog = self.resolve_tool_catalog();
        let document = self.prepare_document(objective, context_snapshot, tool_catalog.as_deref())?;
        let orchestrator = DocumentOrchestrator::new(&document);
        info!(document = %document.display(), "pipeline run started");

        // Stage 1: metacognitive analysis.
        let stage1 = {
            let context = create_stage1_context(&document, objective, None);
            let research = self.stage1_research_bridge();
            let text = self
                .stage1
                .analyze(&context, research)
                .await
                .inspect_err(|err| log_stage_failure("Stage 1 metacognitive analysis", err))?;
            let text = normalize(&text);
            orchestrator.register_stage_output(StageSlot::Stage1, &text)?;
            text
        };

        // Stage 2-A: candidate strategy enumeration.
        let stage2_candidate = {
            let context = create_stage2a_context(&document, objective, None);
            let text = self
                .stage2_candidate
                .analyze(&context, self.options.candidate_limit)
                .await
                .inspect_err(|err| log_stage_failure("Stage 2-A candidate enumeration", err))?;
            let text = normalize(&text);
            orchestrator.register_stage_output(StageSlot::Stage2Candidate, &text)?;
            text
        };

        // Stage 2-B: strategy selection, with HTTP retry.
        let stage2_selection = {
            let text = self
                .run_stage2_selection_with_retries(&document, objective)
                .await
                .inspect_err(|err| log_stage_failure("Stage 2-B strategy selection", err))?;
            let text = normalize(&text);
            orchestrator.register_stage_output(StageSlot::Stage2Selection, &text)?;
            text
        };

        // Stage 2-C: strategy library upgrade.
        let stage2_upgrade = {
            let context = create_stage2b_context(&document, "", None);
            let text = self
                .stage2_upgrade
                .evaluate(&context, None)
                .await
                .inspect_err(|err| log_stage_failure("Stage 2-C strategy upgrade", err))?;
            let text = normalize(&text);
            if text.is_empty() {
                None
            } else {
                orchestrator.register_stage_output(StageSlot::Stage2Upgrade, &text)?;
                Some(text)
            }
        };

        // Stage 3: execution planning.
        let stage3 = {
            let context = create_stage3_context(&document, objective, None, None);
            let text = self
                .stage3
                .analyze(&context)
                .await
                .inspect_err(|err| log_stage_failure("Stage 3 execution planning", err))?;
            let text = normalize(&text);
            orchestrator.register_stage_output(StageSlot::Stage3, &text)?;
            text
        };

        // Stage 4: tool-driven execution against the live plan.
        let stage4 = {
            let context = create_stage4_context(&document, objective, None, context_snapshot);
            let text = self
                .stage4
                .execute(&context, &self.bridge, self.watcher.as_ref(), &orchestrator)
                .await
                .inspect_err(|err| log_stage_failure("Stage 4 execution", err))?;
            let text = normalize(&text);
            orchestrator.register_stage_output(StageSlot::Stage4, &text)?;
            text
        };

        let watcher_audit = Some(load_stage_output(&document, WATCHER_AUDIT))
            .filter(|text| !text.is_empty() && text != PLACEHOLDER);

        // Capability library upgrade, post-run.
        let capability_upgrade = {
            let context = create_stage1_context(&document, "", None);
            let text = self
                .capability
                .evaluate(&context, None)
                .await
                .inspect_err(|err| log_stage_failure("Capability library upgrade", err))?;
            let text = normalize(&text);
            if text.is_empty() { None } else { Some(text) }
        };

        orchestrator.finalize_document()?;
        info!(document = %document.display(), "pipeline run finished");

        Ok(PipelineRun {
            document,
            stage1,
            stage2_candidate,
            stage2_selection,
            stage2_upgrade,
            stage3,
            stage4,
            watcher_audit,
            capability_upgrade,
        })
    }

    /// Expose the bridge so per-stage front-ends can share the interpreter
    /// namespace with a full run.
    pub fn bridge(&self) -> &ToolsBridge {
        &self.bridge
    }

    async fn run_stage2_selection_with_retries(
        &self,
        document: &Path,
        objective: &str,
    ) -> Result<String> {
        let context = create_stage2b_context(document, objective, None);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.stage2_selection.analyze(&context).await {
                Ok(text) => return Ok(text),
                Err(err) if attempt < STAGE2B_RETRY_ATTEMPTS && is_http_error(&err) => {
                    warn!(
                        attempt,
                        max = STAGE2B_RETRY_ATTEMPTS,
                        error = %err,
                        "stage 2-B attempt failed, retrying"
                    );
                    tokio::time::sleep(STAGE2B_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Adopt a document: the one the provisioner just created, else the
    /// most recently modified form in the directory.
    fn prepare_document(
        &self,
        objective: &str,
        context_snapshot: Option<&str>,
        tool_catalog: Option<&[String]>,
    ) -> Result<PathBuf> {
        let before = list_documents(&self.options.finish_form_dir)?;
        let created = self.provisioner.provision()?;

        let document = match created {
            Some(path) => path,
            None => {
                let after = list_documents(&self.options.finish_form_dir)?;
                let fresh = after.iter().find(|path| !before.contains(path)).cloned();
                match fresh.or(most_recent_document(&self.options.finish_form_dir)?) {
                    Some(path) => path,
                    None => bail!("unable to create or locate a collaboration form document"),
                }
            }
        };

        let pairs: Vec<(&str, &str)> =
            RECOGNIZED_ANCHORS.iter().map(|name| (*name, PLACEHOLDER)).collect();
        ensure_markers(&document, &pairs)?;

        DocumentOrchestrator::new(&document)
            .write_external_info(objective, context_snapshot, tool_catalog)
            .context("writing external info")?;
        Ok(document)
    }

    fn resolve_tool_catalog(&self) -> Option<Vec<String>> {
        if let Some(catalog) = &self.options.tool_catalog {
            if !catalog.is_empty() {
                return Some(catalog.clone());
            }
        }
        let loaded = load_tool_catalog(&self.options.tool_catalog_path);
        if loaded.is_empty() { None } else { Some(loaded) }
    }

    fn stage1_research_bridge(&self) -> Option<&ToolsBridge> {
        if !self.options.stage1_research {
            return None;
        }
        let has_provider = [TAVILY_API_KEY_ENV, FIRECRAWL_API_KEY_ENV]
            .iter()
            .any(|key| env::var(key).is_ok_and(|v| !v.trim().is_empty()));
        has_provider.then_some(&self.bridge)
    }
}

/// With the closed reply types, normalization is just whitespace hygiene.
fn normalize(text: &str) -> String {
    text.trim().to_string()
}

fn is_http_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LlmError>().is_some_and(LlmError::is_http)
}

/// Operator-facing failure banner, in addition to the tracing record.
fn log_stage_failure(stage: &str, err: &anyhow::Error) {
    let line = "=".repeat(60);
    eprintln!("\n{line}\n{stage} failed: {err:#}\n{line}\n");
    tracing::error!(stage, error = %err, "stage failed");
}
