//! `formflow`: full-pipeline runner and per-stage front-ends.
//!
//! Exit codes: 0 success, 1 execution error, 130 user interrupt.

mod stages;

use std::io::{self, IsTerminal, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use formflow_config::{ModelConfig, ReasoningEffort, api_key_from_env};
use formflow_llm::OpenAiChatClient;
use formflow_runtime::{PipelineOptions, PipelineRun, PipelineRunner};

#[derive(Debug, Parser)]
#[command(
    name = "formflow",
    version,
    about = "Multi-stage reasoning pipeline around a collaboration form"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stage 1: metacognitive analysis of an existing document.
    Stage1(stages::StageArgs),
    /// Stage 2-A: candidate strategy enumeration.
    Stage2a(stages::Stage2aArgs),
    /// Stage 2-B: strategy selection.
    Stage2b(stages::StageArgs),
    /// Stage 3: execution planning.
    Stage3(stages::StageArgs),
    /// Stage 4: tool-driven execution of the live plan.
    Stage4(stages::Stage4Args),
}

#[derive(Debug, Clone, Args)]
pub(crate) struct ModelFlags {
    /// API key; falls back to DEEPSEEK_API_KEY / OPENAI_API_KEY / KIMI_API_KEY.
    #[arg(long)]
    api_key: Option<String>,
    /// Model name (env MODEL_NAME overrides).
    #[arg(long)]
    model: Option<String>,
    /// Chat endpoint base URL (env MODEL_BASE_URL overrides).
    #[arg(long)]
    base_url: Option<String>,
    /// Stream model output.
    #[arg(long)]
    stream: bool,
}

impl ModelFlags {
    pub(crate) fn resolve(&self) -> Result<ModelConfig> {
        let config = ModelConfig::resolve(
            self.api_key.clone(),
            self.model.clone(),
            self.base_url.clone(),
            self.stream,
        );
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliReasoningEffort {
    Low,
    Medium,
    High,
}

impl From<CliReasoningEffort> for ReasoningEffort {
    fn from(effort: CliReasoningEffort) -> Self {
        match effort {
            CliReasoningEffort::Low => ReasoningEffort::Low,
            CliReasoningEffort::Medium => ReasoningEffort::Medium,
            CliReasoningEffort::High => ReasoningEffort::High,
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Task objective.  Prompted interactively when omitted on a TTY.
    #[arg(long)]
    objective: Option<String>,
    /// Supplementary context snapshot.
    #[arg(long)]
    context: Option<String>,
    /// Cap on Stage 2-A candidate strategies.
    #[arg(long)]
    candidate_limit: Option<usize>,
    /// Directory holding collaboration form documents.
    #[arg(long, default_value = "finish_form")]
    finish_dir: PathBuf,
    /// Standard template file.
    #[arg(long, default_value = "form_templates/standard_template.md")]
    template: PathBuf,
    /// Document encoding (only utf-8 is supported).
    #[arg(long, default_value = "utf-8")]
    encoding: String,
    /// Directory of agent prompt files.
    #[arg(long, default_value = "prompts")]
    prompts_dir: PathBuf,
    /// Disable Stage 2-C strategy-library auto apply.
    #[arg(long)]
    no_strategy_auto_apply: bool,
    /// Enable capability-library auto apply.
    #[arg(long)]
    auto_apply_capability: bool,
    /// Comma-separated tool catalog entries (overrides the catalog file).
    #[arg(long)]
    tool_catalog: Option<String>,
    /// Disable the Watcher supervision agent.
    #[arg(long)]
    no_watcher: bool,

    #[command(flatten)]
    model: ModelFlags,

    /// Watcher API key override.
    #[arg(long)]
    watcher_api_key: Option<String>,
    /// Watcher model override.
    #[arg(long)]
    watcher_model: Option<String>,
    /// Watcher base URL override.
    #[arg(long)]
    watcher_base_url: Option<String>,
    /// Watcher reasoning depth.
    #[arg(long, value_enum)]
    watcher_reasoning_effort: Option<CliReasoningEffort>,
    /// Stream Watcher responses.
    #[arg(long)]
    watcher_stream: bool,
}

fn init_logging() {
    let _ = std::fs::create_dir_all("logs");
    let file_appender = tracing_appender::rolling::daily("logs", "formflow.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    // Keep the guard alive for the process lifetime.
    Box::leak(Box::new(guard));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(1);
        }
    };

    let outcome = runtime.block_on(async {
        tokio::select! {
            result = dispatch(cli) => result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ncancelled.");
                Err(Interrupted.into())
            }
        }
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is::<Interrupted>() => ExitCode::from(130),
        Err(err) => {
            eprintln!("execution failed: {err:#}");
            ExitCode::from(1)
        }
    }
}

/// Marker error that maps Ctrl-C onto exit code 130.
#[derive(Debug)]
struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted by user")
    }
}

impl std::error::Error for Interrupted {}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        None => run_pipeline(cli.run).await,
        Some(Commands::Stage1(args)) => stages::run_stage1(args).await,
        Some(Commands::Stage2a(args)) => stages::run_stage2a(args).await,
        Some(Commands::Stage2b(args)) => stages::run_stage2b(args).await,
        Some(Commands::Stage3(args)) => stages::run_stage3(args).await,
        Some(Commands::Stage4(args)) => stages::run_stage4(args).await,
    }
}

async fn run_pipeline(args: RunArgs) -> Result<()> {
    validate_encoding(&args.encoding)?;

    let objective = match &args.objective {
        Some(objective) if !objective.trim().is_empty() => objective.trim().to_string(),
        _ => prompt_objective()?,
    };

    let config = args.model.resolve()?;
    let model = Arc::new(OpenAiChatClient::new(config.clone()));

    let watcher_model = if args.no_watcher {
        None
    } else {
        let watcher_config = ModelConfig {
            api_key: api_key_from_env()
                .or_else(|| args.watcher_api_key.clone())
                .or_else(|| config.api_key.clone()),
            model_name: args.watcher_model.clone().unwrap_or_else(|| config.model_name.clone()),
            base_url: args.watcher_base_url.clone().unwrap_or_else(|| config.base_url.clone()),
            stream: config.stream || args.watcher_stream,
            reasoning_effort: args.watcher_reasoning_effort.map(Into::into),
        };
        watcher_config.validate()?;
        Some(Arc::new(OpenAiChatClient::new(watcher_config)) as Arc<dyn formflow_llm::ChatModel>)
    };

    let options = PipelineOptions {
        finish_form_dir: args.finish_dir.clone(),
        template_path: args.template.clone(),
        prompts_dir: Some(args.prompts_dir.clone()),
        strategy_auto_apply: !args.no_strategy_auto_apply,
        capability_auto_apply: args.auto_apply_capability,
        watcher_enabled: !args.no_watcher,
        candidate_limit: args.candidate_limit,
        tool_catalog: parse_tool_catalog(args.tool_catalog.as_deref()),
        ..PipelineOptions::default()
    };

    let mut runner = PipelineRunner::new(model, watcher_model, options);
    let run = runner.run(&objective, args.context.as_deref()).await?;
    print_run(&run);
    Ok(())
}

fn validate_encoding(encoding: &str) -> Result<()> {
    let normalized = encoding.trim().to_ascii_lowercase().replace('-', "");
    if normalized != "utf8" {
        bail!("unsupported encoding '{encoding}': only utf-8 documents are supported");
    }
    Ok(())
}

fn prompt_objective() -> Result<String> {
    if !io::stdin().is_terminal() {
        bail!("no objective given (pass --objective)");
    }
    print!("Enter the task objective: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let objective = line.trim().to_string();
    if objective.is_empty() {
        bail!("no objective given, run cancelled");
    }
    Ok(objective)
}

fn parse_tool_catalog(raw: Option<&str>) -> Option<Vec<String>> {
    let items: Vec<String> = raw?
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

fn print_run(run: &PipelineRun) {
    let divider = "=".repeat(80);
    println!("{divider}");
    println!("stage agent outputs");
    println!("{divider}");
    let sections: [(&str, &str); 5] = [
        ("Stage 1 analysis", run.stage1.as_str()),
        ("Stage 2-A candidates", run.stage2_candidate.as_str()),
        ("Stage 2-B selection", run.stage2_selection.as_str()),
        ("Stage 3 plan", run.stage3.as_str()),
        ("Stage 4 execution", run.stage4.as_str()),
    ];
    for (title, content) in sections {
        println!("\n{title}");
        println!("{}", "-".repeat(title.len()));
        let content = content.trim();
        if content.is_empty() {
            println!("(no output)");
        } else {
            println!("{content}");
        }
    }
    println!("\n{divider}");
    println!("pipeline complete.");
    println!("- collaboration form: {}", run.document.display());
    if run.stage2_upgrade.is_some() {
        println!("- strategy library patch evaluated.");
    }
    if run.capability_upgrade.is_some() {
        println!("- capability library upgrade evaluated.");
    }
}
