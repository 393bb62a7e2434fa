//! Ordered list of context sections and their markdown rendering.

/// One block of the composed prompt.  `content` is always non-empty after
/// trimming; sections that would trim to nothing are never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSection {
    pub header: String,
    pub content: String,
    pub source: String,
}

#[derive(Debug, Default)]
pub struct MemoryBridge {
    sections: Vec<ContextSection>,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.sections.clear();
    }

    pub fn sections(&self) -> &[ContextSection] {
        &self.sections
    }

    pub fn add_section(&mut self, header: &str, content: &str, source: &str) {
        if content.trim().is_empty() {
            return;
        }
        self.sections.push(ContextSection {
            header: header.trim().to_string(),
            content: content.trim().to_string(),
            source: source.trim().to_string(),
        });
    }

    pub fn add_objective(&mut self, objective: &str) {
        self.add_section("Objective", objective, "user_input");
    }

    pub fn add_context_snapshot(&mut self, snapshot: &str) {
        self.add_section("Context Snapshot", snapshot, "environment");
    }

    pub fn add_user_context(&mut self, content: &str) {
        self.add_section("用户附加上下文", content, "user_input");
    }

    pub fn add_tool_catalog(&mut self, tools: &[String]) {
        let content = tools
            .iter()
            .filter(|tool| !tool.trim().is_empty())
            .map(|tool| format!("- {tool}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.add_section("Available Tools", &content, "system");
    }

    pub fn add_attachments(&mut self, attachments: &str) {
        self.add_section("Task Attachments", attachments, "user_input");
    }

    /// Render all sections as a single markdown string:
    ///
    /// ```text
    /// ## {header} (from {source})
    ///
    /// {content}
    /// ```
    pub fn build_context(&self) -> String {
        if self.sections.is_empty() {
            return String::new();
        }
        let mut parts: Vec<String> = Vec::new();
        for section in &self.sections {
            let header_line = if section.source.is_empty() {
                format!("## {}", section.header)
            } else {
                format!("## {} (from {})", section.header, section.source)
            };
            parts.push(header_line);
            parts.push(String::new());
            parts.push(section.content.clone());
            parts.push(String::new());
        }
        parts.join("\n").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bridge_builds_empty_string() {
        assert_eq!(MemoryBridge::new().build_context(), "");
    }

    #[test]
    fn blank_sections_are_dropped() {
        let mut bridge = MemoryBridge::new();
        bridge.add_section("Empty", "   \n  ", "system");
        assert!(bridge.sections().is_empty());
    }

    #[test]
    fn render_includes_source_attribution() {
        let mut bridge = MemoryBridge::new();
        bridge.add_objective("Say hi");
        bridge.add_context_snapshot("terminal session");
        let context = bridge.build_context();
        assert!(context.starts_with("## Objective (from user_input)\n\nSay hi"));
        assert!(context.contains("## Context Snapshot (from environment)\n\nterminal session"));
    }

    #[test]
    fn sections_keep_insertion_order() {
        let mut bridge = MemoryBridge::new();
        bridge.add_section("B", "second", "x");
        bridge.add_section("A", "first", "y");
        let context = bridge.build_context();
        assert!(context.find("## B").unwrap() < context.find("## A").unwrap());
    }

    #[test]
    fn tool_catalog_renders_bulleted() {
        let mut bridge = MemoryBridge::new();
        bridge.add_tool_catalog(&[
            "web_search: search".to_string(),
            "  ".to_string(),
            "calculate: math".to_string(),
        ]);
        let context = bridge.build_context();
        assert!(context.contains("- web_search: search\n- calculate: math"));
    }
}
