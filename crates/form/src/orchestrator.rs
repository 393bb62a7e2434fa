//! Owns the collaboration form for one run and serializes writes into it.
//!
//! Agents never touch the document directly: the runner lends them context
//! strings built from it and routes every output back through here.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::anchors::{
    EXTERNAL_INFO, PLACEHOLDER, STAGE1_ANALYSIS, STAGE2A_ANALYSIS, STAGE2B_ANALYSIS,
    STAGE2C_ANALYSIS, STAGE3_PLAN, STAGE4_FINAL_ANSWER, STAGE4_TOOL_CALLS,
};
use crate::store::{self, FormError};

/// Where a normalized stage output lands in the form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSlot {
    Stage1,
    Stage2Candidate,
    Stage2Selection,
    Stage2Upgrade,
    Stage3,
    Stage4,
}

impl StageSlot {
    fn anchor(self) -> &'static str {
        match self {
            StageSlot::Stage1 => STAGE1_ANALYSIS,
            StageSlot::Stage2Candidate => STAGE2A_ANALYSIS,
            StageSlot::Stage2Selection => STAGE2B_ANALYSIS,
            StageSlot::Stage2Upgrade => STAGE2C_ANALYSIS,
            StageSlot::Stage3 => STAGE3_PLAN,
            StageSlot::Stage4 => STAGE4_FINAL_ANSWER,
        }
    }

    fn header(self) -> &'static str {
        match self {
            StageSlot::Stage1 => "## Stage 1: Metacognitive Analysis",
            StageSlot::Stage2Candidate => "## Stage 2-A: Candidate Strategies",
            StageSlot::Stage2Selection => "## Stage 2-B: Strategy Selection",
            StageSlot::Stage2Upgrade => "## Stage 2-C: Capability Upgrade Evaluation",
            StageSlot::Stage3 => "## Stage 3: Execution Plan",
            StageSlot::Stage4 => "## Stage 4: Final Answer",
        }
    }
}

pub struct DocumentOrchestrator {
    path: PathBuf,
}

impl DocumentOrchestrator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn document_path(&self) -> &Path {
        &self.path
    }

    /// Fill `EXTERNAL_INFO` with the three adoption-time subsections.
    pub fn write_external_info(
        &self,
        objective: &str,
        context_snapshot: Option<&str>,
        tool_catalog: Option<&[String]>,
    ) -> Result<(), FormError> {
        let mut parts = vec![format!("### 任务目标\n\n{objective}\n")];
        match context_snapshot {
            Some(snapshot) if !snapshot.trim().is_empty() => {
                parts.push(format!("### 外部上下文\n\n{snapshot}\n"));
            }
            _ => parts.push("### 外部上下文\n".to_string()),
        }
        let mut catalog_block = "### 可用工具清单\n".to_string();
        if let Some(catalog) = tool_catalog {
            for tool in catalog {
                catalog_block.push_str(&format!("- {tool}\n"));
            }
        }
        parts.push(catalog_block);

        store::update_section(&self.path, EXTERNAL_INFO, &parts.join("\n"), None)
    }

    /// Write one stage's normalized output into its anchor.
    pub fn register_stage_output(&self, slot: StageSlot, text: &str) -> Result<(), FormError> {
        debug!(anchor = slot.anchor(), chars = text.len(), "registering stage output");
        store::update_section(&self.path, slot.anchor(), text, Some(slot.header()))
    }

    /// Append one structured entry to the Stage-4 execution log.
    pub fn register_tool_call(
        &self,
        iteration: usize,
        tool_name: &str,
        tool_args: &Value,
        tool_output: &str,
        tool_error: Option<&str>,
    ) -> Result<(), FormError> {
        let mut existing = store::read_section(&self.path, STAGE4_TOOL_CALLS)?.unwrap_or_default();
        if existing == PLACEHOLDER {
            existing.clear();
        }

        let args_pretty =
            serde_json::to_string_pretty(tool_args).unwrap_or_else(|_| tool_args.to_string());
        let entry = format!(
            "### Iteration {iteration} | Tool: {tool_name}\n\
             **Args:**\n```json\n{args_pretty}\n```\n\
             **Output:** {}\n\
             **Error:** {}",
            if tool_output.is_empty() { "(none)" } else { tool_output },
            tool_error.unwrap_or("(none)"),
        );

        let new_content = if existing.trim().is_empty() {
            entry
        } else {
            format!("{}\n{entry}", existing.trim())
        };
        store::update_section(
            &self.path,
            STAGE4_TOOL_CALLS,
            &new_content,
            Some("### 1. Execution Log"),
        )
    }

    /// Post-run hook.  Deliberately a no-op today: anchors are durable as
    /// written, and any export/freeze behavior belongs to an explicit
    /// post-run step.  Safe to call more than once.
    pub fn finalize_document(&self) -> Result<(), FormError> {
        debug!(document = %self.path.display(), "finalizing collaboration form");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    fn seeded_form() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "# Collaboration Form\n").unwrap();
        let pairs: Vec<(&str, &str)> = crate::anchors::RECOGNIZED_ANCHORS
            .iter()
            .map(|name| (*name, PLACEHOLDER))
            .collect();
        store::ensure_markers(file.path(), &pairs).unwrap();
        file
    }

    #[test]
    fn stage_output_lands_in_matching_anchor() {
        let file = seeded_form();
        let orchestrator = DocumentOrchestrator::new(file.path());
        orchestrator
            .register_stage_output(StageSlot::Stage1, "analysis text")
            .unwrap();
        assert_eq!(
            store::read_section(file.path(), STAGE1_ANALYSIS).unwrap().as_deref(),
            Some("analysis text")
        );
    }

    #[test]
    fn tool_call_log_replaces_placeholder_then_appends() {
        let file = seeded_form();
        let orchestrator = DocumentOrchestrator::new(file.path());
        orchestrator
            .register_tool_call(1, "calculate", &json!({"expression": "2+2"}), "4", None)
            .unwrap();
        orchestrator
            .register_tool_call(2, "web_search", &json!({"query": "x"}), "", Some("boom"))
            .unwrap();

        let log = store::read_section(file.path(), STAGE4_TOOL_CALLS).unwrap().unwrap();
        assert!(!log.contains(PLACEHOLDER));
        let first = log.find("### Iteration 1 | Tool: calculate").unwrap();
        let second = log.find("### Iteration 2 | Tool: web_search").unwrap();
        assert!(first < second);
        assert!(log.contains("**Output:** 4"));
        assert!(log.contains("**Error:** boom"));
        assert!(log.contains("**Output:** (none)"));
    }

    #[test]
    fn external_info_carries_three_subsections() {
        let file = seeded_form();
        let orchestrator = DocumentOrchestrator::new(file.path());
        orchestrator
            .write_external_info(
                "Say hi",
                Some("snapshot"),
                Some(&["web_search: search the web".to_string()]),
            )
            .unwrap();
        let info = store::read_section(file.path(), EXTERNAL_INFO).unwrap().unwrap();
        assert!(info.contains("### 任务目标"));
        assert!(info.contains("Say hi"));
        assert!(info.contains("### 外部上下文"));
        assert!(info.contains("snapshot"));
        assert!(info.contains("- web_search: search the web"));
    }

    #[test]
    fn finalize_is_idempotent() {
        let file = seeded_form();
        let orchestrator = DocumentOrchestrator::new(file.path());
        orchestrator.finalize_document().unwrap();
        orchestrator.finalize_document().unwrap();
    }
}
