//! Stage-specific context builders.
//!
//! Each stage sees a cumulative descriptor list: external inputs, then every
//! earlier stage's output, in a fixed order.  An anchor contributes a
//! section whenever its body is non-empty after trimming, placeholder token
//! included: a `` `待填写` `` section tells the model the slot exists and is
//! still unfilled, which is different from the anchor being missing.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::warn;

use crate::bridge::MemoryBridge;

/// `(anchor_name, prompt header, attributed source)`
type Descriptor = (&'static str, &'static str, &'static str);

const EXTERNAL_DESCRIPTORS: &[Descriptor] = &[
    ("EXTERNAL_INFO", "External Information", "external_input"),
    ("EXTERNAL_OBJECTIVE", "Task Objective", "external_input"),
    ("EXTERNAL_CONTEXT", "External Context", "external_input"),
    ("EXTERNAL_TOOL_CATALOG", "Available Tools", "external_input"),
];

const STAGE1_DESCRIPTORS: &[Descriptor] = &[("STAGE1_ANALYSIS", "Stage 1 Analysis", "stage1_agent")];

const STAGE2A_DESCRIPTORS: &[Descriptor] =
    &[("STAGE2A_ANALYSIS", "Stage 2-A Analysis", "stage2a_agent")];

const STAGE2B_DESCRIPTORS: &[Descriptor] =
    &[("STAGE2B_ANALYSIS", "Stage 2-B Analysis", "stage2b_agent")];

const STAGE3_DESCRIPTORS: &[Descriptor] = &[("STAGE3_PLAN", "Stage 3 Plan", "stage3_agent")];

const STAGE4_DESCRIPTORS: &[Descriptor] = &[
    ("LIVE_EXECUTION_PLAN", "Live Execution Plan", "system"),
    ("STAGE4_TOOL_CALLS", "Execution Log", "stage4_agent"),
    ("STAGE4_FINAL_ANSWER", "Final Answer to User", "stage4_agent"),
    ("STAGE4_FEEDBACK", "Feedback to Upstream", "stage4_agent"),
];

const WATCHER_DESCRIPTORS: &[Descriptor] = &[
    ("WATCHER_AUDIT", "Watcher Audit Report", "watcher_agent"),
    ("WATCHER_REALTIME", "Watcher Realtime Guidance", "watcher_agent"),
];

/// The Watcher's audit view is deliberately narrow: failure modes, the
/// chosen strategy, and the plan overview.  Nothing else.
const WATCHER_AUDIT_DESCRIPTORS: &[Descriptor] = &[
    ("STAGE1_FAILURE_MODES", "Common Failure Modes", "stage1_agent"),
    ("STAGE2B_STRATEGY_SNAPSHOT", "Final Strategy Snapshot", "stage2b_agent"),
    ("STAGE3_EXECUTION_PLAN", "Execution Plan Overview", "stage3_agent"),
];

pub fn create_stage1_context(path: &Path, objective: &str, user_context: Option<&str>) -> String {
    let mut bridge = MemoryBridge::new();
    bridge.add_objective(objective);
    if let Some(user_context) = user_context {
        bridge.add_user_context(user_context);
    }
    add_from_descriptors(&mut bridge, path, &[EXTERNAL_DESCRIPTORS, STAGE1_DESCRIPTORS]);
    bridge.build_context()
}

pub fn create_stage2a_context(
    path: &Path,
    objective: &str,
    context_snapshot: Option<&str>,
) -> String {
    let mut bridge = MemoryBridge::new();
    bridge.add_objective(objective);
    if let Some(snapshot) = context_snapshot {
        bridge.add_context_snapshot(snapshot);
    }
    add_from_descriptors(
        &mut bridge,
        path,
        &[EXTERNAL_DESCRIPTORS, STAGE1_DESCRIPTORS, STAGE2A_DESCRIPTORS],
    );
    bridge.build_context()
}

pub fn create_stage2b_context(
    path: &Path,
    objective: &str,
    context_snapshot: Option<&str>,
) -> String {
    let mut bridge = MemoryBridge::new();
    bridge.add_objective(objective);
    if let Some(snapshot) = context_snapshot {
        bridge.add_context_snapshot(snapshot);
    }
    add_from_descriptors(
        &mut bridge,
        path,
        &[
            EXTERNAL_DESCRIPTORS,
            STAGE1_DESCRIPTORS,
            STAGE2A_DESCRIPTORS,
            STAGE2B_DESCRIPTORS,
        ],
    );
    bridge.build_context()
}

pub fn create_stage3_context(
    path: &Path,
    objective: &str,
    context_snapshot: Option<&str>,
    attachments: Option<&str>,
) -> String {
    let mut bridge = MemoryBridge::new();
    bridge.add_objective(objective);
    if let Some(snapshot) = context_snapshot {
        bridge.add_context_snapshot(snapshot);
    }
    if let Some(attachments) = attachments {
        bridge.add_attachments(attachments);
    }
    add_from_descriptors(
        &mut bridge,
        path,
        &[
            EXTERNAL_DESCRIPTORS,
            STAGE1_DESCRIPTORS,
            STAGE2A_DESCRIPTORS,
            STAGE2B_DESCRIPTORS,
            STAGE3_DESCRIPTORS,
        ],
    );
    bridge.build_context()
}

pub fn create_stage4_context(
    path: &Path,
    objective: &str,
    attachments: Option<&str>,
    context_snapshot: Option<&str>,
) -> String {
    let mut bridge = MemoryBridge::new();
    bridge.add_objective(objective);
    if let Some(attachments) = attachments {
        bridge.add_attachments(attachments);
    }
    if let Some(snapshot) = context_snapshot {
        bridge.add_context_snapshot(snapshot);
    }
    add_from_descriptors(
        &mut bridge,
        path,
        &[
            EXTERNAL_DESCRIPTORS,
            STAGE1_DESCRIPTORS,
            STAGE2A_DESCRIPTORS,
            STAGE2B_DESCRIPTORS,
            STAGE3_DESCRIPTORS,
            STAGE4_DESCRIPTORS,
            WATCHER_DESCRIPTORS,
        ],
    );
    bridge.build_context()
}

pub fn create_watcher_audit_context(path: &Path, objective: &str) -> String {
    let mut bridge = MemoryBridge::new();
    bridge.add_objective(objective);
    add_from_descriptors(&mut bridge, path, &[WATCHER_AUDIT_DESCRIPTORS]);
    bridge.build_context()
}

/// Plain extraction of one anchor's body, tolerant of a missing document.
/// Returns an empty string when the file or either marker is absent.
pub fn load_stage_output(path: &Path, marker: &str) -> String {
    let Ok(content) = fs::read_to_string(path) else {
        return String::new();
    };
    let start = format!("<!-- {marker}_START -->");
    let end = format!("<!-- {marker}_END -->");
    let Some(start_idx) = content.find(&start) else {
        return String::new();
    };
    let Some(end_idx) = content.find(&end) else {
        return String::new();
    };
    if end_idx < start_idx + start.len() {
        return String::new();
    }
    content[start_idx + start.len()..end_idx].trim().to_string()
}

// ── Internals ────────────────────────────────────────────────────────────────

fn add_from_descriptors(bridge: &mut MemoryBridge, path: &Path, lists: &[&[Descriptor]]) {
    let sections = load_anchor_sections(path);
    for list in lists {
        for (marker, header, source) in *list {
            if let Some(content) = sections.get(*marker) {
                bridge.add_section(header, content, source);
            }
        }
    }
}

/// Scan the whole document once and collect every anchored section whose
/// body is non-empty after trimming.
fn load_anchor_sections(path: &Path) -> HashMap<String, String> {
    let mut sections = HashMap::new();
    let content = match fs::read_to_string(path) {
        Ok(content) => content.replace("\r\n", "\n"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return sections,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read collaboration form");
            return sections;
        }
    };

    let anchor_start = Regex::new(r"<!--\s*([A-Z0-9_]+)_START\s*-->").expect("valid pattern");
    for caps in anchor_start.captures_iter(&content) {
        let marker = caps[1].to_string();
        let whole = caps.get(0).expect("match 0 exists");
        let end_token = format!("<!-- {marker}_END -->");
        let Some(end_offset) = content[whole.end()..].find(&end_token) else {
            continue;
        };
        let body = content[whole.end()..whole.end() + end_offset].trim();
        if body.is_empty() {
            continue;
        }
        sections.entry(marker).or_insert_with(|| body.to_string());
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn form_with(sections: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (name, body) in sections {
            writeln!(file, "<!-- {name}_START -->\n{body}\n<!-- {name}_END -->\n").unwrap();
        }
        file
    }

    #[test]
    fn stage1_sees_external_and_own_anchor_only() {
        let file = form_with(&[
            ("EXTERNAL_INFO", "objective and tools"),
            ("STAGE1_ANALYSIS", "first pass"),
            ("STAGE2A_ANALYSIS", "must not appear"),
        ]);
        let context = create_stage1_context(file.path(), "Say hi", None);
        assert!(context.contains("## External Information (from external_input)"));
        assert!(context.contains("## Stage 1 Analysis (from stage1_agent)"));
        assert!(!context.contains("must not appear"));
    }

    #[test]
    fn descriptor_order_is_preserved() {
        let file = form_with(&[
            ("STAGE2A_ANALYSIS", "candidates"),
            ("STAGE1_ANALYSIS", "analysis"),
            ("EXTERNAL_INFO", "info"),
        ]);
        let context = create_stage2b_context(file.path(), "obj", None);
        let info = context.find("## External Information").unwrap();
        let stage1 = context.find("## Stage 1 Analysis").unwrap();
        let stage2a = context.find("## Stage 2-A Analysis").unwrap();
        assert!(info < stage1 && stage1 < stage2a);
    }

    #[test]
    fn placeholder_sections_are_still_surfaced() {
        // An unfilled slot carries the placeholder token into the context;
        // only a truly empty body (or a missing anchor) is dropped.
        let file = form_with(&[("STAGE1_ANALYSIS", "`待填写`"), ("STAGE2A_ANALYSIS", "")]);
        let context = create_stage2b_context(file.path(), "obj", None);
        assert!(context.contains("## Stage 1 Analysis (from stage1_agent)"));
        assert!(context.contains("`待填写`"));
        assert!(!context.contains("Stage 2-A Analysis"));
    }

    #[test]
    fn missing_document_still_yields_objective() {
        let context =
            create_stage1_context(Path::new("/nonexistent/form.md"), "Say hi", Some("extra"));
        assert!(context.contains("## Objective (from user_input)"));
        assert!(context.contains("## 用户附加上下文 (from user_input)"));
    }

    #[test]
    fn stage4_sees_live_plan_and_watcher_anchors() {
        let file = form_with(&[
            ("LIVE_EXECUTION_PLAN", "Objective: x\n## Steps\n1. go"),
            ("WATCHER_AUDIT", "revision trail"),
        ]);
        let context = create_stage4_context(file.path(), "obj", None, None);
        assert!(context.contains("## Live Execution Plan (from system)"));
        assert!(context.contains("## Watcher Audit Report (from watcher_agent)"));
    }

    #[test]
    fn watcher_audit_context_is_narrow() {
        let file = form_with(&[
            ("STAGE1_FAILURE_MODES", "timeouts"),
            ("STAGE2B_STRATEGY_SNAPSHOT", "plan A"),
            ("STAGE3_EXECUTION_PLAN", "three steps"),
            ("STAGE1_ANALYSIS", "must not leak"),
            ("STAGE4_TOOL_CALLS", "must not leak either"),
        ]);
        let context = create_watcher_audit_context(file.path(), "obj");
        assert!(context.contains("## Common Failure Modes"));
        assert!(context.contains("## Final Strategy Snapshot"));
        assert!(context.contains("## Execution Plan Overview"));
        assert!(!context.contains("must not leak"));
    }

    #[test]
    fn load_stage_output_handles_missing_marker() {
        let file = form_with(&[("WATCHER_AUDIT", "trail")]);
        assert_eq!(load_stage_output(file.path(), "WATCHER_AUDIT"), "trail");
        assert_eq!(load_stage_output(file.path(), "ABSENT"), "");
        assert_eq!(load_stage_output(Path::new("/nonexistent/f.md"), "A"), "");
    }
}
