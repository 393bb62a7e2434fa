//! Anchor names recognized in the collaboration form.

/// Rendered in place of empty section content so a reader can tell
/// "known empty" apart from "marker missing".
pub const PLACEHOLDER: &str = "`待填写`";

// ── External inputs ──────────────────────────────────────────────────────────

pub const EXTERNAL_INFO: &str = "EXTERNAL_INFO";
pub const EXTERNAL_OBJECTIVE: &str = "EXTERNAL_OBJECTIVE";
pub const EXTERNAL_CONTEXT: &str = "EXTERNAL_CONTEXT";
pub const EXTERNAL_TOOL_CATALOG: &str = "EXTERNAL_TOOL_CATALOG";

// ── Stage outputs ────────────────────────────────────────────────────────────

pub const STAGE1_ANALYSIS: &str = "STAGE1_ANALYSIS";
pub const STAGE1_FAILURE_MODES: &str = "STAGE1_FAILURE_MODES";
pub const STAGE2A_ANALYSIS: &str = "STAGE2A_ANALYSIS";
pub const STAGE2B_ANALYSIS: &str = "STAGE2B_ANALYSIS";
pub const STAGE2B_STRATEGY_SNAPSHOT: &str = "STAGE2B_STRATEGY_SNAPSHOT";
pub const STAGE2C_ANALYSIS: &str = "STAGE2C_ANALYSIS";
pub const STAGE3_PLAN: &str = "STAGE3_PLAN";
pub const STAGE3_EXECUTION_PLAN: &str = "STAGE3_EXECUTION_PLAN";

// ── Live execution ───────────────────────────────────────────────────────────

pub const LIVE_EXECUTION_PLAN: &str = "LIVE_EXECUTION_PLAN";
pub const STAGE4_TOOL_CALLS: &str = "STAGE4_TOOL_CALLS";
pub const STAGE4_FINAL_ANSWER: &str = "STAGE4_FINAL_ANSWER";
pub const STAGE4_FEEDBACK: &str = "STAGE4_FEEDBACK";

// ── Watcher ──────────────────────────────────────────────────────────────────

pub const WATCHER_AUDIT: &str = "WATCHER_AUDIT";
pub const WATCHER_REALTIME: &str = "WATCHER_REALTIME";

/// Every anchor a writer may touch.  `ensure_markers` seeds all of these on
/// a freshly provisioned document so later writes never need the
/// header-insertion fallback.
pub const RECOGNIZED_ANCHORS: &[&str] = &[
    EXTERNAL_INFO,
    EXTERNAL_OBJECTIVE,
    EXTERNAL_CONTEXT,
    EXTERNAL_TOOL_CATALOG,
    STAGE1_ANALYSIS,
    STAGE1_FAILURE_MODES,
    STAGE2A_ANALYSIS,
    STAGE2B_ANALYSIS,
    STAGE2B_STRATEGY_SNAPSHOT,
    STAGE2C_ANALYSIS,
    STAGE3_PLAN,
    STAGE3_EXECUTION_PLAN,
    LIVE_EXECUTION_PLAN,
    STAGE4_TOOL_CALLS,
    STAGE4_FINAL_ANSWER,
    STAGE4_FEEDBACK,
    WATCHER_AUDIT,
    WATCHER_REALTIME,
];

pub fn start_marker(name: &str) -> String {
    format!("<!-- {name}_START -->")
}

pub fn end_marker(name: &str) -> String {
    format!("<!-- {name}_END -->")
}
