//! Template provisioning: make sure a collaboration form exists before the
//! run starts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use tracing::{debug, info};

use crate::anchors::{PLACEHOLDER, RECOGNIZED_ANCHORS};
use crate::store;

/// Copies the standard template into the target directory when the
/// directory holds fewer documents than `threshold`.
///
/// The runner decides adoption separately: it snapshots the directory before
/// provisioning and picks either the file reported here or the most recently
/// modified document.
#[derive(Debug, Clone)]
pub struct TemplateProvisioner {
    template_path: PathBuf,
    target_dir: PathBuf,
    threshold: usize,
}

impl TemplateProvisioner {
    pub fn new(
        template_path: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        threshold: usize,
    ) -> Self {
        Self {
            template_path: template_path.into(),
            target_dir: target_dir.into(),
            threshold: threshold.max(1),
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Create a new document if the directory is under the threshold.
    ///
    /// Returns the path of the created document, or `None` when no creation
    /// was necessary.  A missing template file is a configuration error.
    pub fn provision(&self) -> Result<Option<PathBuf>> {
        if !self.template_path.is_file() {
            bail!("template file not found: {}", self.template_path.display());
        }
        fs::create_dir_all(&self.target_dir)
            .with_context(|| format!("creating {}", self.target_dir.display()))?;

        let existing = list_documents(&self.target_dir)?;
        if existing.len() >= self.threshold {
            debug!(
                count = existing.len(),
                threshold = self.threshold,
                "document directory at capacity, reusing existing forms"
            );
            return Ok(None);
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut target = self.target_dir.join(format!("finish_form_{stamp}.md"));
        // Two runs inside the same second must not clobber each other.
        let mut suffix = 1;
        while target.exists() {
            target = self.target_dir.join(format!("finish_form_{stamp}_{suffix}.md"));
            suffix += 1;
        }

        fs::copy(&self.template_path, &target)
            .with_context(|| format!("copying template to {}", target.display()))?;

        let pairs: Vec<(&str, &str)> = RECOGNIZED_ANCHORS
            .iter()
            .map(|name| (*name, PLACEHOLDER))
            .collect();
        store::ensure_markers(&target, &pairs)?;

        info!(document = %target.display(), "provisioned collaboration form");
        Ok(Some(target))
    }
}

/// Markdown documents in the directory, unordered.
pub fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut docs = Vec::new();
    if !dir.is_dir() {
        return Ok(docs);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("md") {
            docs.push(path);
        }
    }
    Ok(docs)
}

/// The most recently modified document in the directory.
pub fn most_recent_document(dir: &Path) -> Result<Option<PathBuf>> {
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    for path in list_documents(dir)? {
        let modified = fs::metadata(&path)?.modified()?;
        if best.as_ref().is_none_or(|(t, _)| modified > *t) {
            best = Some((modified, path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::read_section;

    fn template_file(dir: &Path) -> PathBuf {
        let path = dir.join("template.md");
        fs::write(&path, "# Collaboration Form\n").unwrap();
        path
    }

    #[test]
    fn provision_copies_template_and_seeds_anchors() {
        let tmp = tempfile::tempdir().unwrap();
        let template = template_file(tmp.path());
        let target = tmp.path().join("forms");

        let provisioner = TemplateProvisioner::new(&template, &target, 8);
        let created = provisioner.provision().unwrap().expect("document created");

        assert!(created.exists());
        for anchor in RECOGNIZED_ANCHORS {
            assert_eq!(
                read_section(&created, anchor).unwrap().as_deref(),
                Some(PLACEHOLDER),
                "anchor {anchor} missing"
            );
        }
    }

    #[test]
    fn provision_skips_when_directory_at_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let template = template_file(tmp.path());
        let target = tmp.path().join("forms");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("existing.md"), "# Form\n").unwrap();

        let provisioner = TemplateProvisioner::new(&template, &target, 1);
        assert!(provisioner.provision().unwrap().is_none());
    }

    #[test]
    fn missing_template_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner =
            TemplateProvisioner::new(tmp.path().join("absent.md"), tmp.path().join("forms"), 8);
        assert!(provisioner.provision().is_err());
    }

    #[test]
    fn most_recent_document_prefers_latest_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let older = tmp.path().join("older.md");
        let newer = tmp.path().join("newer.md");
        fs::write(&older, "a").unwrap();
        fs::write(&newer, "b").unwrap();
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = fs::File::open(&older).unwrap();
        file.set_modified(past).unwrap();

        assert_eq!(most_recent_document(tmp.path()).unwrap(), Some(newer));
    }
}
