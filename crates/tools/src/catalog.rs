//! Tool catalog loading.
//!
//! The catalog is a markdown file with `##` provider sections and
//! `- name: description` bullets:
//!
//! ```markdown
//! # Tool Catalog
//!
//! ## Search
//! - web_search: layered web search with fallback queries.
//!
//! ## Interpreter
//! - code_interpreter: sandboxed snippet execution.
//! ```
//!
//! Only `- ` bullets are recognized; entries render as
//! `Section · name: description` and are deduped preserving order.

use std::fs;
use std::path::Path;

pub const DEFAULT_TOOL_CATALOG_PATH: &str = "tools/tool_catalog.md";

pub fn load_tool_catalog(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut entries: Vec<String> = Vec::new();
    let mut current_section: Option<String> = None;

    for line in content.lines() {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        if let Some(heading) = stripped.strip_prefix('#') {
            if stripped.starts_with("##") {
                current_section = Some(heading.trim_start_matches('#').trim().to_string());
            }
            continue;
        }
        let Some(item) = stripped.strip_prefix("- ") else {
            continue;
        };
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let entry = match item.split_once(':') {
            Some((name, description)) => {
                let name = name.trim();
                let description = description.trim();
                let qualified = match &current_section {
                    Some(section) => format!("{section} · {name}"),
                    None => name.to_string(),
                };
                if description.is_empty() {
                    qualified
                } else {
                    format!("{qualified}: {description}")
                }
            }
            None => match &current_section {
                Some(section) => format!("{section} · {item}"),
                None => item.to_string(),
            },
        };
        entries.push(entry);
    }

    dedup_preserving_order(entries)
}

/// Merge catalogs, dropping duplicates while keeping first-seen order.
pub fn merge_tool_catalogs(catalogs: &[Option<Vec<String>>]) -> Option<Vec<String>> {
    let combined: Vec<String> = catalogs
        .iter()
        .flatten()
        .flatten()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    let deduped = dedup_preserving_order(combined);
    if deduped.is_empty() { None } else { Some(deduped) }
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn catalog_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_sectioned_bullets() {
        let file = catalog_file(
            "# Catalog\n\n## Search\n- web_search: find things online\n\n## Math\n- calculate: arithmetic\n- bare_item\n",
        );
        let entries = load_tool_catalog(file.path());
        assert_eq!(
            entries,
            vec![
                "Search · web_search: find things online",
                "Math · calculate: arithmetic",
                "Math · bare_item",
            ]
        );
    }

    #[test]
    fn ignores_non_bullet_lines_and_dedups() {
        let file = catalog_file("## S\nplain prose\n- a: one\n- a: one\n");
        assert_eq!(load_tool_catalog(file.path()), vec!["S · a: one"]);
    }

    #[test]
    fn missing_file_is_empty() {
        assert!(load_tool_catalog(Path::new("/nonexistent/catalog.md")).is_empty());
    }

    #[test]
    fn merge_keeps_first_seen_order() {
        let merged = merge_tool_catalogs(&[
            Some(vec!["a".to_string(), "b".to_string()]),
            None,
            Some(vec!["b".to_string(), "c".to_string()]),
        ])
        .unwrap();
        assert_eq!(merged, vec!["a", "b", "c"]);
    }

    #[test]
    fn merge_of_nothing_is_none() {
        assert_eq!(merge_tool_catalogs(&[None, Some(vec![])]), None);
    }
}
