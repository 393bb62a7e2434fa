//! Library patch engine.
//!
//! Shared by the two upgrade agents: one maintains the capability library,
//! one the strategy library.  The engine parses the decision envelope an
//! agent emitted, enforces the acceptance policy (decision, action,
//! justification, novelty, per-category quota), and appends accepted bodies
//! to the library file under an advisory lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

mod envelope;
mod store;

pub use envelope::{
    JUSTIFICATION_KEYS, PatchEnvelope, category_letter, extract_patch_body, parse_envelope,
    primary_entry_id,
};
pub use store::LibraryStore;

/// Acceptance policy knobs.  The capability variant drops the `ACTION`
/// requirement but keeps everything else.
#[derive(Debug, Clone)]
pub struct PatchPolicy {
    pub min_reference_ids: usize,
    pub max_new_per_category: usize,
    pub require_action: bool,
}

impl Default for PatchPolicy {
    fn default() -> Self {
        Self { min_reference_ids: 2, max_new_per_category: 1, require_action: true }
    }
}

impl PatchPolicy {
    pub fn capability() -> Self {
        Self { require_action: false, ..Self::default() }
    }
}

/// What happened to one candidate patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied { detail: String },
    Skipped { reason: String },
}

impl PatchOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, PatchOutcome::Applied { .. })
    }
}

pub struct PatchEngine {
    store: LibraryStore,
    policy: PatchPolicy,
    auto_apply: bool,
    /// New entries accepted this session, per category letter.
    session_new_counts: HashMap<char, usize>,
    last_patch_markdown: Option<String>,
    last_applied_path: Option<PathBuf>,
}

impl PatchEngine {
    pub fn new(store: LibraryStore, policy: PatchPolicy, auto_apply: bool) -> Self {
        Self {
            store,
            policy,
            auto_apply,
            session_new_counts: HashMap::new(),
            last_patch_markdown: None,
            last_applied_path: None,
        }
    }

    pub fn library_path(&self) -> &Path {
        self.store.path()
    }

    pub fn snapshot(&self, max_chars: Option<usize>) -> Option<String> {
        self.store.snapshot(max_chars)
    }

    pub fn last_patch_markdown(&self) -> Option<&str> {
        self.last_patch_markdown.as_deref()
    }

    pub fn last_applied_path(&self) -> Option<&Path> {
        self.last_applied_path.as_deref()
    }

    /// Evaluate one agent reply and apply its patch when it passes policy.
    /// Never fails the stage: every rejection is an observable
    /// `PatchOutcome::Skipped`.
    pub fn process(&mut self, result_text: &str) -> PatchOutcome {
        let envelope = parse_envelope(result_text);
        let body = extract_patch_body(result_text);

        let outcome = self.review(&envelope, body.as_deref());
        match &outcome {
            PatchOutcome::Applied { detail } => {
                let body = body.expect("applied outcome implies a body");
                self.last_patch_markdown = Some(body);
                self.last_applied_path = Some(self.store.path().to_path_buf());
                info!(library = %self.store.path().display(), %detail, "library patch applied");
            }
            PatchOutcome::Skipped { reason } => {
                self.last_patch_markdown = None;
                self.last_applied_path = None;
                info!(%reason, "library patch skipped");
            }
        }
        outcome
    }

    fn review(&mut self, envelope: &PatchEnvelope, body: Option<&str>) -> PatchOutcome {
        let skip = |reason: String| PatchOutcome::Skipped { reason };

        let Some(decision) = envelope.decision.as_deref() else {
            return skip("missing decision header".to_string());
        };
        if decision != "APPLY" {
            return skip(format!("decision={decision}"));
        }
        let Some(body) = body else {
            return skip("no patch content detected".to_string());
        };
        if !self.auto_apply {
            return skip("auto-apply disabled".to_string());
        }

        let action = envelope.action.as_deref().unwrap_or("");
        if self.policy.require_action && !matches!(action, "create_new" | "enhance_existing") {
            return skip(format!(
                "unsupported action: {}",
                if action.is_empty() { "missing" } else { action }
            ));
        }

        for key in JUSTIFICATION_KEYS {
            if envelope.justification.get(*key).is_none_or(|value| value.trim().is_empty()) {
                return skip(format!("missing justification for {key}"));
            }
        }

        if envelope.reference_ids.len() < self.policy.min_reference_ids {
            return skip("insufficient reference_ids to prove novelty".to_string());
        }

        let existing = self.store.existing_ids();

        if action == "enhance_existing" {
            let Some(target) = envelope.target_id.as_deref() else {
                return skip("missing target_id for enhancement action".to_string());
            };
            if !existing.contains(target) {
                return skip(format!("target strategy {target} not found"));
            }
            if let Err(err) = self.store.append(body, None) {
                warn!(error = %err, "library append failed");
                return skip(format!("apply failed: {err}"));
            }
            return PatchOutcome::Applied { detail: format!("enhanced existing strategy {target}") };
        }

        // create_new path (also taken by the capability variant when no
        // action header is required).
        let Some(new_id) = primary_entry_id(body) else {
            return skip("unable to locate new strategy id in patch".to_string());
        };
        if existing.contains(&new_id) {
            return skip(format!("strategy id {new_id} already exists"));
        }
        let letter = new_id.chars().next().unwrap_or('?');
        let used = self.session_new_counts.get(&letter).copied().unwrap_or(0);
        if used >= self.policy.max_new_per_category {
            return skip(format!("category {letter} reached new strategy quota"));
        }
        if let Err(err) = self.store.append(body, Some(&new_id)) {
            warn!(error = %err, "library append failed");
            return skip(format!("apply failed: {err}"));
        }
        *self.session_new_counts.entry(letter).or_insert(0) += 1;
        PatchOutcome::Applied { detail: format!("accepted new strategy {new_id}") }
    }
}

/// Guarantee the `AUTO_APPLY_STATUS` line on an upgrade-agent output.
pub fn annotate_status(result_text: &str, outcome: &PatchOutcome) -> String {
    if result_text.contains("AUTO_APPLY_STATUS:") {
        return result_text.to_string();
    }
    let status = match outcome {
        PatchOutcome::Applied { .. } => "AUTO_APPLY_STATUS: applied".to_string(),
        PatchOutcome::Skipped { reason } => format!("AUTO_APPLY_STATUS: skipped ({reason})"),
    };
    format!("{}\n\n{status}", result_text.trim_end())
}
