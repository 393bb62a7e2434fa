//! Upgrade agents: evolve the strategy and capability libraries through the
//! patch engine's decision grammar.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use formflow_form::store::update_section;
use formflow_library::{LibraryStore, PatchEngine, PatchOutcome, PatchPolicy, annotate_status};
use formflow_llm::ChatModel;

use crate::base::{AgentCore, load_prompt};

/// How much library text is embedded into the system prompt before the
/// truncation marker kicks in.
const SNAPSHOT_MAX_CHARS: usize = 12_000;

pub const STRATEGY_LIBRARY_FILE: &str = "strategy_library/strategy.md";
pub const CAPABILITY_LIBRARY_FILE: &str = "ability_library/ability.md";

/// One agent instance per library.  The reply is parsed as a decision
/// envelope, run through the acceptance policy, and annotated with
/// `AUTO_APPLY_STATUS`, on every reply, applied or skipped.
pub struct UpgradeAgent {
    core: AgentCore,
    engine: PatchEngine,
    write_marker: Option<(&'static str, &'static str)>,
}

impl UpgradeAgent {
    /// The Stage 2-C strategy-library maintainer.  Writes its evaluation
    /// through to the `STAGE2C_ANALYSIS` anchor when a document is given.
    pub fn strategy(
        model: Arc<dyn ChatModel>,
        prompts_dir: Option<&Path>,
        library_file: &Path,
        auto_apply: bool,
    ) -> Self {
        let store = LibraryStore::new(library_file, auto_apply);
        let prompt = prompts_dir.and_then(|dir| load_prompt(&dir.join("stage2c.md")));
        let prompt = with_snapshot(prompt, &store, "Current Strategy Library Snapshot");
        Self {
            core: AgentCore::new(model, prompt),
            engine: PatchEngine::new(store, PatchPolicy::default(), auto_apply),
            write_marker: Some(("STAGE2C_ANALYSIS", "## Stage 2-C: Capability Upgrade Evaluation")),
        }
    }

    /// The post-run capability-library maintainer.  No document
    /// write-through; the runner surfaces its output directly.
    pub fn capability(
        model: Arc<dyn ChatModel>,
        prompts_dir: Option<&Path>,
        library_file: &Path,
        auto_apply: bool,
    ) -> Self {
        let store = LibraryStore::new(library_file, auto_apply);
        let prompt = prompts_dir.and_then(|dir| load_prompt(&dir.join("capability.md")));
        let prompt = with_snapshot(prompt, &store, "Current Capability Library Snapshot");
        Self {
            core: AgentCore::new(model, prompt),
            engine: PatchEngine::new(store, PatchPolicy::capability(), auto_apply),
            write_marker: None,
        }
    }

    pub fn library_path(&self) -> &Path {
        self.engine.library_path()
    }

    pub fn last_patch_markdown(&self) -> Option<&str> {
        self.engine.last_patch_markdown()
    }

    pub fn last_applied_path(&self) -> Option<&Path> {
        self.engine.last_applied_path()
    }

    /// Evaluate the library against the composed context and apply any
    /// accepted patch.  Returns the annotated stage output.
    pub async fn evaluate(&mut self, context: &str, document: Option<&Path>) -> Result<String> {
        let result_text = self.core.invoke(context).await?;
        let outcome = self.engine.process(&result_text);
        if let PatchOutcome::Applied { detail } = &outcome {
            info!(library = %self.engine.library_path().display(), %detail, "upgrade applied");
        }
        let annotated = annotate_status(&result_text, &outcome);

        if let (Some(path), Some((marker, header))) = (document, self.write_marker) {
            update_section(path, marker, &annotated, Some(header))?;
        }
        Ok(annotated)
    }
}

fn with_snapshot(prompt: Option<String>, store: &LibraryStore, label: &str) -> Option<String> {
    let snapshot = store.snapshot(Some(SNAPSHOT_MAX_CHARS))?;
    let section = format!("## {label}\n\n{snapshot}");
    Some(match prompt {
        Some(prompt) => format!("{prompt}\n\n{section}"),
        None => section,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::testing::MockModel;
    use formflow_form::store::read_section;
    use std::fs;
    use std::io::Write as _;

    const LIBRARY: &str = "# Strategy Library\n\n### I. Interaction\n\n\
        #### ask first (I1)\nbody one\n\n#### verify sources (I2)\nbody two\n";

    fn library_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("strategy.md");
        fs::write(&path, LIBRARY).unwrap();
        path
    }

    fn apply_reply(id: &str) -> String {
        format!(
            "Evaluation notes.\n\nDECISION: APPLY\nACTION: create_new\nCATEGORY: I\n\
             REFERENCE_IDS: I1, I2\ncoverage_gap: g\nreuse_failure: f\nnew_value: v\n\
             REASON: because\n\n#### fresh strategy ({id})\npatch body\n"
        )
    }

    #[tokio::test]
    async fn accepted_patch_reports_applied_status() {
        let dir = tempfile::tempdir().unwrap();
        let library = library_file(dir.path());
        let reply = apply_reply("I3");
        let model = Arc::new(MockModel::scripted(&[reply.as_str()]));
        let mut agent = UpgradeAgent::strategy(model, None, &library, true);

        let output = agent.evaluate("## Objective\n\nx", None).await.unwrap();
        assert!(output.ends_with("AUTO_APPLY_STATUS: applied"));
        assert_eq!(agent.last_applied_path().unwrap(), library.as_path());
        assert!(fs::read_to_string(&library).unwrap().contains("fresh strategy (I3)"));
    }

    #[tokio::test]
    async fn duplicate_id_reports_skip_reason() {
        let dir = tempfile::tempdir().unwrap();
        let library = library_file(dir.path());
        let reply = apply_reply("I2");
        let model = Arc::new(MockModel::scripted(&[reply.as_str()]));
        let mut agent = UpgradeAgent::strategy(model, None, &library, true);

        let output = agent.evaluate("## Objective\n\nx", None).await.unwrap();
        assert!(output.ends_with("AUTO_APPLY_STATUS: skipped (strategy id I2 already exists)"));
        assert!(agent.last_patch_markdown().is_none());
        assert!(!fs::read_to_string(&library).unwrap().contains("fresh strategy"));
    }

    #[tokio::test]
    async fn evaluation_writes_through_to_document() {
        let dir = tempfile::tempdir().unwrap();
        let library = library_file(dir.path());
        let mut form = tempfile::NamedTempFile::new().unwrap();
        write!(form, "<!-- STAGE2C_ANALYSIS_START -->\n`待填写`\n<!-- STAGE2C_ANALYSIS_END -->\n")
            .unwrap();

        let model = Arc::new(MockModel::scripted(&["DECISION: REJECT\nREASON: nothing new"]));
        let mut agent = UpgradeAgent::strategy(model, None, &library, true);
        agent.evaluate("## Objective\n\nx", Some(form.path())).await.unwrap();

        let written = read_section(form.path(), "STAGE2C_ANALYSIS").unwrap().unwrap();
        assert!(written.contains("AUTO_APPLY_STATUS: skipped (decision=REJECT)"));
    }

    #[tokio::test]
    async fn snapshot_is_embedded_in_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let library = library_file(dir.path());
        let model = Arc::new(MockModel::scripted(&["DECISION: REJECT\nREASON: n"]));
        let mut agent = UpgradeAgent::strategy(model.clone(), None, &library, true);
        agent.evaluate("## Objective\n\nx", None).await.unwrap();

        let calls = model.calls.lock().unwrap();
        let system = &calls[0][0].content;
        assert!(system.contains("## Current Strategy Library Snapshot"));
        assert!(system.contains("#### ask first (I1)"));
    }
}
