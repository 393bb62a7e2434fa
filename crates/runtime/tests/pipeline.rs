//! End-to-end pipeline runs against a scripted model.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use formflow_form::store::read_section;
use formflow_llm::{ChatMessage, ChatModel, ChatResponse, LlmError, ModelReply};
use formflow_runtime::{PipelineOptions, PipelineRunner};

/// Returns canned replies in order, repeating the last one when the script
/// runs dry.
struct ScriptedModel {
    replies: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self { replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()) })
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<ModelReply, LlmError> {
        let mut replies = self.replies.lock().unwrap();
        let reply = if replies.len() > 1 {
            replies.pop().unwrap_or_default()
        } else {
            replies.last().cloned().unwrap_or_default()
        };
        Ok(ModelReply::Complete(ChatResponse::from_text(reply)))
    }
}

/// Fails with an HTTP error a fixed number of times, then hands off to a
/// fixed reply.
struct FlakyModel {
    failures_left: Mutex<usize>,
    reply: String,
}

#[async_trait::async_trait]
impl ChatModel for FlakyModel {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<ModelReply, LlmError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(LlmError::Api { status: 502, body: "bad gateway".to_string() });
        }
        Ok(ModelReply::Complete(ChatResponse::from_text(self.reply.clone())))
    }
}

struct Workspace {
    _dir: tempfile::TempDir,
    options: PipelineOptions,
}

fn workspace() -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("template.md");
    fs::write(&template, "# Collaboration Form\n").unwrap();

    let strategy_library = dir.path().join("strategy_library/strategy.md");
    fs::create_dir_all(strategy_library.parent().unwrap()).unwrap();
    fs::write(
        &strategy_library,
        "# Strategy Library\n\n### I. Interaction\n\n#### ask first (I1)\nbody\n\n#### verify sources (I2)\nbody\n",
    )
    .unwrap();

    let options = PipelineOptions {
        finish_form_dir: dir.path().join("finish_form"),
        template_path: template,
        prompts_dir: None,
        strategy_library,
        capability_library: dir.path().join("ability_library/ability.md"),
        watcher_enabled: false,
        stage1_research: false,
        tool_catalog: Some(vec!["calculate: restricted math evaluation".to_string()]),
        ..PipelineOptions::default()
    };
    Workspace { _dir: dir, options }
}

fn document_path(run_document: &Path, options: &PipelineOptions) -> PathBuf {
    assert!(run_document.starts_with(&options.finish_form_dir));
    run_document.to_path_buf()
}

const REJECT_REPLY: &str = "DECISION: REJECT\nREASON: nothing new this session";

#[tokio::test]
async fn empty_context_run_fills_every_stage_anchor() {
    let ws = workspace();
    let model = ScriptedModel::new(&[
        "stage one analysis",
        "stage two candidates",
        "stage two selection",
        REJECT_REPLY,
        "stage three plan",
        "Final Answer: hi",
        REJECT_REPLY,
    ]);
    let mut runner = PipelineRunner::new(model, None, ws.options.clone());

    let run = runner.run("Say hi", None).await.unwrap();

    assert_eq!(run.stage1, "stage one analysis");
    assert_eq!(run.stage2_candidate, "stage two candidates");
    assert_eq!(run.stage2_selection, "stage two selection");
    assert!(run.stage2_upgrade.as_deref().unwrap().contains("AUTO_APPLY_STATUS: skipped"));
    assert_eq!(run.stage3, "stage three plan");
    assert_eq!(run.stage4, "Final Answer: hi");
    assert!(run.watcher_audit.is_none());
    assert!(run.capability_upgrade.as_deref().unwrap().contains("AUTO_APPLY_STATUS"));

    let document = document_path(&run.document, &ws.options);
    for (anchor, expected) in [
        ("STAGE1_ANALYSIS", "stage one analysis"),
        ("STAGE2A_ANALYSIS", "stage two candidates"),
        ("STAGE2B_ANALYSIS", "stage two selection"),
        ("STAGE3_PLAN", "stage three plan"),
        ("STAGE4_FINAL_ANSWER", "Final Answer: hi"),
    ] {
        let body = read_section(&document, anchor).unwrap().unwrap();
        assert_eq!(body, expected, "anchor {anchor}");
    }

    let external = read_section(&document, "EXTERNAL_INFO").unwrap().unwrap();
    assert!(external.contains("Say hi"));
    assert!(external.contains("calculate: restricted math evaluation"));
}

#[tokio::test]
async fn tool_loop_logs_calculate_call_and_answer() {
    let ws = workspace();
    let model = ScriptedModel::new(&[
        "s1",
        "s2a",
        "s2b",
        REJECT_REPLY,
        "1. calculate 2+2\n2. report the result",
        "[TOOL_CALL]\ntool: calculate\nexpression: \"2+2\"\n[/TOOL_CALL]",
        "Final Answer: 4",
        REJECT_REPLY,
    ]);
    let mut runner = PipelineRunner::new(model, None, ws.options.clone());

    let run = runner.run("Compute 2+2", None).await.unwrap();
    assert!(run.stage4.contains("4"));

    let document = document_path(&run.document, &ws.options);
    let log = read_section(&document, "STAGE4_TOOL_CALLS").unwrap().unwrap();
    assert!(log.contains("### Iteration 1 | Tool: calculate"));
    assert!(log.contains("**Output:** 4"));

    let live_plan = read_section(&document, "LIVE_EXECUTION_PLAN").unwrap().unwrap();
    assert!(live_plan.contains("## Steps"));
    assert!(live_plan.contains("1. calculate 2+2"));
}

#[tokio::test]
async fn stage2b_retries_http_errors() {
    // Stage 1, 2-A run off the scripted model; 2-B hits the flaky one.
    // A single shared model keeps this simple: the first two replies feed
    // stages 1 and 2-A, then two HTTP failures burn retries in 2-B.
    struct Sequenced {
        scripted: Mutex<Vec<String>>,
        failures_at: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl ChatModel for Sequenced {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<ModelReply, LlmError> {
            let mut calls = self.failures_at.lock().unwrap();
            *calls += 1;
            // Calls 3 and 4 are the first two Stage 2-B attempts.
            if *calls == 3 || *calls == 4 {
                return Err(LlmError::Api { status: 503, body: "unavailable".to_string() });
            }
            let mut replies = self.scripted.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop().unwrap_or_default()
            } else {
                replies.last().cloned().unwrap_or_default()
            };
            Ok(ModelReply::Complete(ChatResponse::from_text(reply)))
        }
    }

    let replies =
        ["s1", "s2a", "selection after retries", REJECT_REPLY, "plan", "Final Answer: ok", REJECT_REPLY];
    let model = Arc::new(Sequenced {
        scripted: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
        failures_at: Mutex::new(0),
    });

    let ws = workspace();
    let mut runner = PipelineRunner::new(model, None, ws.options.clone());
    let run = runner.run("Say hi", None).await.unwrap();
    assert_eq!(run.stage2_selection, "selection after retries");
}

#[tokio::test]
async fn persistent_http_failure_aborts_the_run() {
    let ws = workspace();
    let model = Arc::new(FlakyModel {
        failures_left: Mutex::new(usize::MAX),
        reply: String::new(),
    });
    let mut runner = PipelineRunner::new(model, None, ws.options.clone());
    let err = runner.run("Say hi", None).await.unwrap_err();
    assert!(err.to_string().contains("502") || format!("{err:#}").contains("502"));
}

#[tokio::test]
async fn strategy_patch_is_applied_to_library() {
    let ws = workspace();
    let apply_reply = "DECISION: APPLY\nACTION: create_new\nCATEGORY: I\n\
        REFERENCE_IDS: I1, I2\ncoverage_gap: g\nreuse_failure: f\nnew_value: v\nREASON: r\n\n\
        #### escalate broad queries (I3)\nWhen narrow queries dry up, widen scope.\n";
    let model = ScriptedModel::new(&[
        "s1",
        "s2a",
        "s2b",
        apply_reply,
        "plan",
        "Final Answer: done",
        REJECT_REPLY,
    ]);
    let mut runner = PipelineRunner::new(model, None, ws.options.clone());
    let run = runner.run("Say hi", None).await.unwrap();

    assert!(run.stage2_upgrade.as_deref().unwrap().ends_with("AUTO_APPLY_STATUS: applied"));
    let library = fs::read_to_string(&ws.options.strategy_library).unwrap();
    assert!(library.contains("#### escalate broad queries (I3)"));

    let document = document_path(&run.document, &ws.options);
    let stage2c = read_section(&document, "STAGE2C_ANALYSIS").unwrap().unwrap();
    assert!(stage2c.contains("AUTO_APPLY_STATUS: applied"));
}
