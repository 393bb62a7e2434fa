//! Per-stage front-ends: run one agent against an existing collaboration
//! form.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Args;

use formflow_agents::{
    CandidateStrategyAgent, ExecutionPlanningAgent, MetacognitiveAnalysisAgent,
    Stage4ExecutorAgent, StrategySelectionAgent, WatcherAgent,
};
use formflow_form::orchestrator::{DocumentOrchestrator, StageSlot};
use formflow_llm::{ChatModel, OpenAiChatClient};
use formflow_memory::{
    create_stage1_context, create_stage2a_context, create_stage2b_context, create_stage3_context,
    create_stage4_context,
};
use formflow_tools::ToolsBridge;

use crate::ModelFlags;

#[derive(Debug, Args)]
pub struct StageArgs {
    /// Path to the collaboration form document.
    #[arg(long)]
    pub document: PathBuf,
    /// Task objective.
    #[arg(long)]
    pub objective: String,
    /// Directory of agent prompt files.
    #[arg(long, default_value = "prompts")]
    pub prompts_dir: PathBuf,

    #[command(flatten)]
    pub model: ModelFlags,
}

#[derive(Debug, Args)]
pub struct Stage2aArgs {
    #[command(flatten)]
    pub stage: StageArgs,
    /// Cap on candidate strategies.
    #[arg(long)]
    pub candidate_limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct Stage4Args {
    #[command(flatten)]
    pub stage: StageArgs,
    /// Iteration ceiling for the tool loop.
    #[arg(long, default_value_t = 10)]
    pub max_iterations: usize,
    /// Disable the Watcher for this run.
    #[arg(long)]
    pub no_watcher: bool,
}

fn model_for(args: &StageArgs) -> Result<Arc<dyn ChatModel>> {
    let config = args.model.resolve()?;
    Ok(Arc::new(OpenAiChatClient::new(config)))
}

fn check_document(args: &StageArgs) -> Result<()> {
    if !args.document.is_file() {
        bail!("collaboration form not found: {}", args.document.display());
    }
    Ok(())
}

pub async fn run_stage1(args: StageArgs) -> Result<()> {
    check_document(&args)?;
    let model = model_for(&args)?;
    let agent = MetacognitiveAnalysisAgent::new(model, Some(&args.prompts_dir), None);
    let context = create_stage1_context(&args.document, &args.objective, None);
    let text = agent.analyze(&context, None).await?;
    DocumentOrchestrator::new(&args.document).register_stage_output(StageSlot::Stage1, &text)?;
    println!("{text}");
    Ok(())
}

pub async fn run_stage2a(args: Stage2aArgs) -> Result<()> {
    check_document(&args.stage)?;
    let model = model_for(&args.stage)?;
    let agent = CandidateStrategyAgent::new(model, Some(&args.stage.prompts_dir));
    let context = create_stage2a_context(&args.stage.document, &args.stage.objective, None);
    let text = agent.analyze(&context, args.candidate_limit).await?;
    DocumentOrchestrator::new(&args.stage.document)
        .register_stage_output(StageSlot::Stage2Candidate, &text)?;
    println!("{text}");
    Ok(())
}

pub async fn run_stage2b(args: StageArgs) -> Result<()> {
    check_document(&args)?;
    let model = model_for(&args)?;
    let agent = StrategySelectionAgent::new(model, Some(&args.prompts_dir));
    let context = create_stage2b_context(&args.document, &args.objective, None);
    let text = agent.analyze(&context).await?;
    DocumentOrchestrator::new(&args.document)
        .register_stage_output(StageSlot::Stage2Selection, &text)?;
    println!("{text}");
    Ok(())
}

pub async fn run_stage3(args: StageArgs) -> Result<()> {
    check_document(&args)?;
    let model = model_for(&args)?;
    let agent = ExecutionPlanningAgent::new(model, Some(&args.prompts_dir));
    let context = create_stage3_context(&args.document, &args.objective, None, None);
    let text = agent.analyze(&context).await?;
    DocumentOrchestrator::new(&args.document).register_stage_output(StageSlot::Stage3, &text)?;
    println!("{text}");
    Ok(())
}

pub async fn run_stage4(args: Stage4Args) -> Result<()> {
    check_document(&args.stage)?;
    let model = model_for(&args.stage)?;
    let agent =
        Stage4ExecutorAgent::new(Arc::clone(&model), Some(&args.stage.prompts_dir), args.max_iterations);
    let watcher = (!args.no_watcher)
        .then(|| WatcherAgent::new(Arc::clone(&model), Some(&args.stage.prompts_dir)));
    let bridge = ToolsBridge::default();

    let context = create_stage4_context(&args.stage.document, &args.stage.objective, None, None);
    let orchestrator = DocumentOrchestrator::new(&args.stage.document);
    let text = agent.execute(&context, &bridge, watcher.as_ref(), &orchestrator).await?;
    orchestrator.register_stage_output(StageSlot::Stage4, &text)?;
    println!("{text}");
    Ok(())
}
