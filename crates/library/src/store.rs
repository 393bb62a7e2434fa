//! Library file access: ID scanning, snapshots, locked append with backup.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Local;
use fs2::FileExt;
use regex::Regex;
use tracing::debug;

/// Any parenthesized ID anywhere in the file counts as taken.
static ANY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([A-Z][A-Z0-9\-]+)\)").expect("valid pattern"));

#[derive(Debug, Clone)]
pub struct LibraryStore {
    path: PathBuf,
    auto_backup: bool,
}

impl LibraryStore {
    pub fn new(path: impl Into<PathBuf>, auto_backup: bool) -> Self {
        Self { path: path.into(), auto_backup }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every ID currently present in the library.  Missing file reads as an
    /// empty library.
    pub fn existing_ids(&self) -> HashSet<String> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return HashSet::new();
        };
        ANY_ID.captures_iter(&text).map(|caps| caps[1].trim().to_uppercase()).collect()
    }

    /// The library text for prompt embedding, truncated with a visible tail
    /// marker when over `max_chars`.  `None` when the library is missing or
    /// empty.
    pub fn snapshot(&self, max_chars: Option<usize>) -> Option<String> {
        let text = fs::read_to_string(&self.path).ok()?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        match max_chars {
            Some(limit) if text.chars().count() > limit => {
                let truncated: String = text.chars().take(limit).collect();
                Some(format!("{}\n\n...[Content truncated]...", truncated.trim_end()))
            }
            _ => Some(text.to_string()),
        }
    }

    /// Append a patch body under an exclusive advisory lock.
    ///
    /// `guard_id` is re-checked against the file *inside* the lock: two
    /// runners sharing the library cannot both create the same ID even when
    /// both validated it as free beforehand.
    pub fn append(&self, body: &str, guard_id: Option<&str>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.lock_exclusive().context("locking library file")?;

        let result = (|| -> Result<()> {
            if let Some(id) = guard_id {
                let current = fs::read_to_string(&self.path).unwrap_or_default();
                let taken: HashSet<String> = ANY_ID
                    .captures_iter(&current)
                    .map(|caps| caps[1].trim().to_uppercase())
                    .collect();
                if taken.contains(&id.to_uppercase()) {
                    anyhow::bail!("strategy id {id} already exists");
                }
            }

            if self.auto_backup {
                self.write_backup()?;
            }

            let mut file = &file;
            let existing = fs::read_to_string(&self.path).unwrap_or_default();
            if !existing.is_empty() && !existing.ends_with('\n') {
                writeln!(file)?;
            }
            writeln!(file, "\n{}", body.trim_end())?;
            file.flush()?;
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn write_backup(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let stem = self.path.file_stem().and_then(|s| s.to_str()).unwrap_or("library");
        let backup = self.path.with_file_name(format!("{stem}.{stamp}.bak"));
        fs::copy(&self.path, &backup)
            .with_context(|| format!("writing backup {}", backup.display()))?;
        debug!(backup = %backup.display(), "library backup written");
        Ok(())
    }
}
