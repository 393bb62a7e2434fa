//! Atomic read/write of anchor-delimited sections.
//!
//! There is no partial-file append: every update reads the whole document,
//! mutates it in memory, and writes it back in one pass.  Callers serialize
//! updates per document; inside a run that is guaranteed because every
//! write flows through the single `DocumentOrchestrator` task.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};

use crate::anchors::{self, LIVE_EXECUTION_PLAN, PLACEHOLDER};

pub const LIVE_PLAN_HEADER: &str = "## Live Execution Plan";

#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("collaboration form not found: {0}")]
    MissingDocument(PathBuf),
    #[error("io error on collaboration form: {0}")]
    Io(#[from] io::Error),
}

/// Read the trimmed content between a marker pair.
///
/// Returns `Ok(None)` when the file or either marker is missing; readers
/// tolerate absence, only writers treat it as an error.
pub fn read_section(path: &Path, name: &str) -> Result<Option<String>, FormError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let normalized = text.replace("\r\n", "\n");
    Ok(section_pattern(name)
        .captures(&normalized)
        .map(|caps| caps[1].trim().to_string()))
}

/// Replace the first marker pair's body.
///
/// Empty content becomes the placeholder token before the write.  When the
/// pair is absent a new block is inserted right after `header` if that line
/// exists, otherwise appended at end of file.  A missing document is a hard
/// error for writers.
pub fn update_section(
    path: &Path,
    name: &str,
    content: &str,
    header: Option<&str>,
) -> Result<(), FormError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(FormError::MissingDocument(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    let normalized = text.replace("\r\n", "\n");

    let sanitized = sanitize(content);
    let block = format!(
        "{}\n{}\n{}",
        anchors::start_marker(name),
        sanitized,
        anchors::end_marker(name)
    );

    let pattern = replace_pattern(name);
    let new_text = if pattern.is_match(&normalized) {
        pattern
            .replacen(&normalized, 1, |_: &regex::Captures<'_>| block.clone())
            .into_owned()
    } else {
        insert_block(&normalized, &block, header)
    };

    fs::write(path, new_text)?;
    Ok(())
}

/// Append an empty block for each missing marker pair.  Idempotent; a
/// missing document is silently skipped (the provisioner has not run yet).
pub fn ensure_markers(path: &Path, pairs: &[(&str, &str)]) -> Result<(), FormError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let mut text = text.replace("\r\n", "\n");
    let mut updated = false;

    for (name, placeholder) in pairs {
        let start = anchors::start_marker(name);
        let end = anchors::end_marker(name);
        if text.contains(&start) && text.contains(&end) {
            continue;
        }
        let body = if placeholder.is_empty() { PLACEHOLDER } else { placeholder };
        let block = format!("{start}\n{body}\n{end}");
        text = format!("{}\n\n{}\n", text.trim_end_matches('\n'), block);
        updated = true;
    }

    if updated {
        fs::write(path, text)?;
    }
    Ok(())
}

pub fn read_live_plan(path: &Path) -> Result<Option<String>, FormError> {
    read_section(path, LIVE_EXECUTION_PLAN)
}

pub fn update_live_plan(path: &Path, content: &str) -> Result<(), FormError> {
    update_section(path, LIVE_EXECUTION_PLAN, content, Some(LIVE_PLAN_HEADER))
}

// ── Internals ────────────────────────────────────────────────────────────────

fn sanitize(content: &str) -> &str {
    let trimmed = content.trim();
    if trimmed.is_empty() { PLACEHOLDER } else { trimmed }
}

/// `<start> (body) <end>`, dot-matches-all, lazily so only the first pair is
/// consumed.
fn section_pattern(name: &str) -> Regex {
    RegexBuilder::new(&format!(
        r"{}\s*(.*?)\s*{}",
        regex::escape(&anchors::start_marker(name)),
        regex::escape(&anchors::end_marker(name))
    ))
    .dot_matches_new_line(true)
    .build()
    .expect("anchor pattern is valid")
}

fn replace_pattern(name: &str) -> Regex {
    RegexBuilder::new(&format!(
        r"{}.*?{}",
        regex::escape(&anchors::start_marker(name)),
        regex::escape(&anchors::end_marker(name))
    ))
    .dot_matches_new_line(true)
    .build()
    .expect("anchor pattern is valid")
}

fn insert_block(text: &str, block: &str, header: Option<&str>) -> String {
    if let Some(header) = header {
        if let Some(pos) = text.find(header) {
            let after_header = pos + header.len();
            let insert_at = match text[after_header..].find('\n') {
                Some(offset) => after_header + offset + 1,
                None => text.len(),
            };
            let before = text[..insert_at].trim_end_matches('\n');
            let after = text[insert_at..].trim_start_matches('\n');
            return format!("{before}\n\n{block}\n{after}");
        }
    }
    format!("{}\n\n{}\n", text.trim_end_matches('\n'), block)
}
