//! Shared agent plumbing: prompt loading, library concatenation, model
//! invocation with stream collation, and context-section extraction.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use formflow_llm::{ChatMessage, ChatModel, LlmError};

/// The uniform invoke core every agent wraps.
#[derive(Clone)]
pub struct AgentCore {
    model: Arc<dyn ChatModel>,
    system_prompt: Option<String>,
}

impl AgentCore {
    pub fn new(model: Arc<dyn ChatModel>, system_prompt: Option<String>) -> Self {
        Self { model, system_prompt }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Seed the message list with the system prompt, when one is loaded.
    pub fn base_messages(&self) -> Vec<ChatMessage> {
        match &self.system_prompt {
            Some(prompt) => vec![ChatMessage::system(prompt.clone())],
            None => Vec::new(),
        }
    }

    /// One-shot invoke: system prompt + a single user message.
    pub async fn invoke(&self, user_content: &str) -> Result<String, LlmError> {
        let mut messages = self.base_messages();
        messages.push(ChatMessage::user(user_content.trim()));
        self.invoke_messages(&messages).await
    }

    /// Invoke with an explicit conversation, collating streamed replies.
    pub async fn invoke_messages(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let reply = self.model.chat(messages).await?;
        Ok(reply.collate().await)
    }
}

/// Load a prompt file, returning `None` when it is missing or blank.
/// Agents run fine without a prompt; the context is self-describing.
pub fn load_prompt(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Concatenate a library directory under `## {label}: {title}` headings and
/// append it to the prompt.  Files are visited in name order; the title is
/// the file stem with underscores spaced.
pub fn prompt_with_library_dir(
    prompt: Option<String>,
    library_dir: &Path,
    label: &str,
) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();
    if library_dir.is_dir() {
        let mut files: Vec<_> = fs::read_dir(library_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("md"))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        for file in files {
            let Ok(data) = fs::read_to_string(&file) else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            let title = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("library")
                .replace('_', " ");
            sections.push(format!("## {label}: {title}\n\n{data}"));
        }
    }

    if sections.is_empty() {
        return prompt;
    }
    let merged = sections.join("\n\n");
    debug!(label, sections = sections.len(), "library sections appended to prompt");
    match prompt {
        Some(prompt) => Some(format!("{prompt}\n\n{merged}")),
        None => Some(merged),
    }
}

/// Pull one `## {header}` section out of a composed context string.  The
/// header line may carry a `(from ...)` attribution suffix.
pub fn extract_section(context: &str, header: &str) -> String {
    let needle = format!("## {header}");
    let mut capture = false;
    let mut lines: Vec<&str> = Vec::new();
    for line in context.lines() {
        let stripped = line.trim();
        if stripped.starts_with(&needle) {
            capture = true;
            continue;
        }
        if capture {
            if stripped.starts_with("## ") {
                break;
            }
            lines.push(line);
        }
    }
    lines.join("\n").trim().to_string()
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn extract_section_tolerates_attribution() {
        let context = "## Objective (from user_input)\n\nSay hi\n\n## Context Snapshot (from environment)\n\nterm\n";
        assert_eq!(extract_section(context, "Objective"), "Say hi");
        assert_eq!(extract_section(context, "Context Snapshot"), "term");
        assert_eq!(extract_section(context, "Missing"), "");
    }

    #[test]
    fn prompt_with_missing_library_dir_passes_through() {
        let prompt = prompt_with_library_dir(
            Some("base prompt".to_string()),
            Path::new("/nonexistent/dir"),
            "Ability Library",
        );
        assert_eq!(prompt.as_deref(), Some("base prompt"));
    }

    #[test]
    fn prompt_concatenates_library_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b_second.md"), "second body").unwrap();
        fs::write(dir.path().join("a_first.md"), "first body").unwrap();
        fs::write(dir.path().join("empty.md"), "  ").unwrap();

        let prompt =
            prompt_with_library_dir(Some("base".to_string()), dir.path(), "Ability Library")
                .unwrap();
        let first = prompt.find("## Ability Library: a first").unwrap();
        let second = prompt.find("## Ability Library: b second").unwrap();
        assert!(prompt.starts_with("base"));
        assert!(first < second);
        assert!(!prompt.contains("empty"));
    }

    #[tokio::test]
    async fn invoke_prepends_system_prompt() {
        let model = Arc::new(testing::MockModel::scripted(&["reply"]));
        let core = AgentCore::new(model.clone(), Some("be brief".to_string()));
        let text = core.invoke("context here").await.unwrap();
        assert_eq!(text, "reply");

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls[0].len(), 2);
        assert_eq!(calls[0][0].content, "be brief");
        assert_eq!(calls[0][1].content, "context here");
    }
}
