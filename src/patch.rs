//! Patches and their atomic application.
//!
//! A [`Patch`] is proposed by the reasoning capability for exactly one
//! [`Diagnosis`](crate::diagnosis::Diagnosis). The [`PatchApplicator`] commits
//! it to disk: the current on-disk source is read under an exclusive lock,
//! every substitution anchor must occur verbatim, and the result is written
//! through a synced temp file renamed over the original. Either the whole
//! patch lands or the file is left untouched.

use crate::artifact::TestArtifact;
use crate::error::{HealError, Result};
use crate::parse::extract_json_payload_where;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".mender.tmp";

/// One targeted substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOp {
    pub old_string: String,
    pub new_string: String,
}

impl EditOp {
    pub fn new(old_string: impl Into<String>, new_string: impl Into<String>) -> Self {
        Self {
            old_string: old_string.into(),
            new_string: new_string.into(),
        }
    }
}

/// How a patch changes the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchEdit {
    /// Full-file replacement
    Replace { content: String },
    /// Targeted substitutions anchored to the current source
    Substitute { edits: Vec<EditOp> },
}

/// A proposed change to the test artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    /// The diagnosis this patch answers
    pub diagnosis_id: String,
    /// File the patch claims to target, when the response named one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub edit: PatchEdit,
    pub rationale: String,
}

impl Patch {
    /// Full-file replacement patch.
    pub fn replace(
        diagnosis_id: impl Into<String>,
        content: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self::new(
            diagnosis_id,
            PatchEdit::Replace {
                content: content.into(),
            },
            rationale,
        )
    }

    /// Targeted substitution patch.
    pub fn substitute(
        diagnosis_id: impl Into<String>,
        edits: Vec<EditOp>,
        rationale: impl Into<String>,
    ) -> Self {
        Self::new(diagnosis_id, PatchEdit::Substitute { edits }, rationale)
    }

    fn new(diagnosis_id: impl Into<String>, edit: PatchEdit, rationale: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            diagnosis_id: diagnosis_id.into(),
            file: None,
            edit,
            rationale: rationale.into(),
        }
    }

    /// Set the file the patch targets.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// Wire shape of a patch in a reasoning response.
#[derive(Debug, Deserialize)]
struct PatchResponse {
    #[serde(default)]
    rationale: String,
    #[serde(default, alias = "path")]
    file: Option<PathBuf>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    edits: Option<Vec<EditOp>>,
}

/// Parse a reasoning response into a patch for `diagnosis_id`.
///
/// A response without a locatable JSON payload is a reasoning failure (no
/// patch produced). A payload that parses but carries no usable edit is a
/// malformed patch.
pub fn parse_patch_response(response: &str, diagnosis_id: &str) -> Result<Patch> {
    let payload: PatchResponse = extract_json_payload_where(response, |value| {
        value.get("edits").is_some() || value.get("content").is_some()
    })
    .ok_or_else(|| HealError::reasoning("response contains no patch payload"))?;

    let patch = match (payload.edits, payload.content) {
        (Some(edits), _) if !edits.is_empty() => {
            Patch::substitute(diagnosis_id, edits, payload.rationale)
        }
        (_, Some(content)) if !content.trim().is_empty() => {
            Patch::replace(diagnosis_id, content, payload.rationale)
        }
        (Some(_), _) => return Err(HealError::malformed_patch("patch has empty edits")),
        _ => {
            return Err(HealError::malformed_patch(
                "patch has neither content nor edits",
            ))
        }
    };

    Ok(match payload.file {
        Some(file) => patch.with_file(file),
        None => patch,
    })
}

/// Result of a committed patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    pub before: String,
    pub after: String,
}

/// Applies patches to test artifacts on disk.
#[derive(Debug, Clone, Default)]
pub struct PatchApplicator;

impl PatchApplicator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Apply `patch` to `artifact` atomically.
    ///
    /// The in-memory source is updated only after the new content has been
    /// renamed into place.
    pub fn apply(&self, artifact: &mut TestArtifact, patch: &Patch) -> Result<AppliedPatch> {
        if let Some(file) = &patch.file {
            if !same_target(file, &artifact.path) {
                return Err(HealError::malformed_patch(format!(
                    "patch targets {} but the session artifact is {}",
                    file.display(),
                    artifact.path.display()
                )));
            }
        }

        let path = artifact.path.clone();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| HealError::Other(anyhow::anyhow!("Failed to lock {}: {e}", path.display())))?;

        let mut current = String::new();
        file.read_to_string(&mut current)?;

        let updated = apply_edit(&path, &current, &patch.edit)?;
        let before = fingerprint(&current);
        let after = fingerprint(&updated);
        if before == after {
            return Err(HealError::malformed_patch(
                "patch leaves the source unchanged",
            ));
        }

        let tmp_path = tmp_path_for(&path);
        if let Err(e) = write_and_rename(&tmp_path, &path, &updated) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        drop(file);

        artifact.source = updated;
        debug!(
            path = %path.display(),
            patch = %patch.id,
            before = %before,
            after = %after,
            "Patch committed"
        );
        Ok(AppliedPatch { before, after })
    }
}

fn apply_edit(path: &Path, current: &str, edit: &PatchEdit) -> Result<String> {
    match edit {
        PatchEdit::Replace { content } => {
            if content.trim().is_empty() {
                return Err(HealError::malformed_patch("replacement content is empty"));
            }
            Ok(content.clone())
        }
        PatchEdit::Substitute { edits } => {
            if edits.is_empty() {
                return Err(HealError::malformed_patch("patch has empty edits"));
            }
            let mut updated = current.to_string();
            for op in edits {
                if op.old_string.is_empty() {
                    return Err(HealError::malformed_patch("edit has an empty anchor"));
                }
                let occurrences = updated.matches(op.old_string.as_str()).count();
                if occurrences == 0 {
                    return Err(HealError::patch_conflict(path, op.old_string.clone()));
                }
                if occurrences > 1 {
                    warn!(
                        path = %path.display(),
                        occurrences,
                        "Anchor occurs more than once, replacing the first occurrence"
                    );
                }
                updated = updated.replacen(op.old_string.as_str(), &op.new_string, 1);
            }
            Ok(updated)
        }
    }
}

fn write_and_rename(tmp_path: &Path, path: &Path, content: &str) -> Result<()> {
    let mut tmp_file = File::create(tmp_path)?;
    tmp_file.write_all(content.as_bytes())?;
    tmp_file.sync_all()?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

fn same_target(claimed: &Path, actual: &Path) -> bool {
    claimed == actual || actual.ends_with(claimed) || claimed.ends_with(actual)
}

fn fingerprint(source: &str) -> String {
    format!("{:x}", md5::compute(source.as_bytes()))
}
