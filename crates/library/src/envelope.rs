//! Decision envelope parsing.
//!
//! Upgrade agents emit a prefix of structured headers before a markdown
//! patch body:
//!
//! ```text
//! DECISION: APPLY|REJECT
//! ACTION: create_new|enhance_existing
//! CATEGORY: <letter>
//! TARGET_ID: <existing ID when enhancing>
//! REFERENCE_IDS: id1, id2, ...
//! coverage_gap: <one line>
//! reuse_failure: <one line>
//! new_value: <one line>
//! REASON: <free text>
//!
//! <markdown body>
//! ```

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

fn header_pattern(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .expect("header pattern is valid")
}

static DECISION: LazyLock<Regex> = LazyLock::new(|| header_pattern(r"^DECISION:\s*(\w+)"));
static ACTION: LazyLock<Regex> = LazyLock::new(|| header_pattern(r"^ACTION:\s*([a-z_]+)"));
static CATEGORY: LazyLock<Regex> = LazyLock::new(|| header_pattern(r"^CATEGORY:\s*([A-Z])"));
static TARGET: LazyLock<Regex> = LazyLock::new(|| header_pattern(r"^TARGET_ID:\s*([A-Z0-9\-]+)"));
static REFERENCES: LazyLock<Regex> =
    LazyLock::new(|| header_pattern(r"^REFERENCE_IDS?:\s*([A-Z0-9,\-\s]+)"));
static JUSTIFICATION: LazyLock<Regex> =
    LazyLock::new(|| header_pattern(r"^(coverage_gap|reuse_failure|new_value)\s*:\s*(.+)$"));
static REASON: LazyLock<Regex> = LazyLock::new(|| header_pattern(r"^REASON:\s*(.+)$"));

/// Entry IDs inside a library body: `#### <name> (<ID>)`.
static ENTRY_ID: LazyLock<Regex> =
    LazyLock::new(|| header_pattern(r"^####\s+.*\(([A-Z][A-Z0-9\-]+)\)\s*$"));

/// Category section headers: `### <letter>.`
static CATEGORY_HEADER: LazyLock<Regex> = LazyLock::new(|| header_pattern(r"^###\s+([A-Z])\."));

pub const JUSTIFICATION_KEYS: &[&str] = &["coverage_gap", "reuse_failure", "new_value"];

#[derive(Debug, Clone, Default)]
pub struct PatchEnvelope {
    pub decision: Option<String>,
    pub action: Option<String>,
    pub category: Option<String>,
    pub target_id: Option<String>,
    pub reference_ids: Vec<String>,
    pub justification: HashMap<String, String>,
    pub reason: Option<String>,
}

pub fn parse_envelope(text: &str) -> PatchEnvelope {
    let mut envelope = PatchEnvelope::default();
    if text.is_empty() {
        return envelope;
    }

    envelope.decision = DECISION.captures(text).map(|c| c[1].trim().to_uppercase());
    envelope.action = ACTION.captures(text).map(|c| c[1].trim().to_lowercase());
    envelope.category = CATEGORY.captures(text).map(|c| c[1].trim().to_uppercase());
    envelope.target_id = TARGET.captures(text).map(|c| c[1].trim().to_uppercase());
    envelope.reference_ids = REFERENCES
        .captures(text)
        .map(|c| {
            c[1].split(',')
                .map(|item| item.trim().to_uppercase())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default();
    for caps in JUSTIFICATION.captures_iter(text) {
        envelope
            .justification
            .insert(caps[1].trim().to_lowercase(), caps[2].trim().to_string());
    }
    envelope.reason = REASON.captures(text).map(|c| c[1].trim().to_string());
    envelope
}

/// The markdown body: everything from the first markdown heading onward.
/// Header lines never start with `#`, so the first heading marks the patch.
pub fn extract_patch_body(text: &str) -> Option<String> {
    let offset = text
        .lines()
        .scan(0usize, |pos, line| {
            let start = *pos;
            *pos += line.len() + 1;
            Some((start, line))
        })
        .find(|(_, line)| line.trim_start().starts_with('#'))
        .map(|(start, _)| start)?;
    let body = text[offset..].trim();
    if body.is_empty() { None } else { Some(body.to_string()) }
}

/// The first entry ID declared in a patch body.
pub fn primary_entry_id(body: &str) -> Option<String> {
    ENTRY_ID.captures(body).map(|c| c[1].trim().to_uppercase())
}

/// The first category header letter declared in a patch body.
pub fn category_letter(body: &str) -> Option<String> {
    CATEGORY_HEADER.captures(body).map(|c| c[1].trim().to_uppercase())
}
