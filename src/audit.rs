//! Tamper-evident audit trail for healing sessions.
//!
//! Every session produces one JSONL file in the results directory. The
//! first line is a session header, then one line per iteration record, then
//! the final verdict. Each line carries the SHA-256 hash of the previous
//! line, so any edit, reordering or removal is detected by [`verify`].
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::audit::AuditTrail;
//!
//! let trail = AuditTrail::new(&config.results_dir);
//! let path = trail.write(&session, &config)?;
//! assert!(mender::audit::verify(&path)?.is_valid);
//! ```

use crate::config::HealConfig;
use crate::error::{HealError, Result};
use crate::session::HealingSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Kind of audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryKind {
    /// Session header: artifact, framework, budgets.
    SessionStart,
    /// One iteration record.
    Iteration,
    /// Final verdict and explanation.
    Verdict,
}

impl std::fmt::Display for AuditEntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SessionStart => "session_start",
            Self::Iteration => "iteration",
            Self::Verdict => "verdict",
        };
        write!(f, "{s}")
    }
}

/// An audit line with hash chaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position of this line in the file.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEntryKind,
    pub session_id: String,
    /// Kind-specific data.
    pub data: serde_json::Value,
    /// SHA-256 hash of the previous entry (hex-encoded).
    /// For the first entry, this is a hash of the genesis string.
    pub previous_hash: String,
    /// SHA-256 hash of this entry (hex-encoded).
    pub hash: String,
}

impl AuditEntry {
    /// Compute the hash of this entry from every field except `hash`.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(self.session_id.as_bytes());
        hasher.update(self.data.to_string().as_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Result of verifying an audit file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub entries_verified: u64,
    /// Sequence of the first invalid entry (if any).
    pub first_invalid_entry: Option<u64>,
    pub error_description: Option<String>,
}

impl VerificationResult {
    #[must_use]
    pub fn valid(entries_verified: u64) -> Self {
        Self {
            is_valid: true,
            entries_verified,
            first_invalid_entry: None,
            error_description: None,
        }
    }

    #[must_use]
    pub fn invalid(entries_verified: u64, invalid_entry: u64, error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            entries_verified,
            first_invalid_entry: Some(invalid_entry),
            error_description: Some(error.into()),
        }
    }
}

/// The genesis string hashed for the first entry's `previous_hash`.
const GENESIS_HASH: &str = "mender-audit-genesis-v1";

fn compute_genesis_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(GENESIS_HASH.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash-chain a list of `(kind, timestamp, data)` into entries.
fn chain(
    session_id: &str,
    items: Vec<(AuditEntryKind, DateTime<Utc>, serde_json::Value)>,
) -> Vec<AuditEntry> {
    let mut previous_hash = compute_genesis_hash();
    let mut entries = Vec::with_capacity(items.len());

    for (sequence, (kind, timestamp, data)) in items.into_iter().enumerate() {
        let mut entry = AuditEntry {
            sequence: sequence as u64,
            timestamp,
            kind,
            session_id: session_id.to_string(),
            data,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        previous_hash = entry.hash.clone();
        entries.push(entry);
    }
    entries
}

/// Build the chained audit entries for a session.
pub fn session_entries(session: &HealingSession, config: &HealConfig) -> Result<Vec<AuditEntry>> {
    let mut items = Vec::with_capacity(session.records().len() + 2);

    items.push((
        AuditEntryKind::SessionStart,
        session.started_at,
        serde_json::json!({
            "artifact": session.artifact.path.display().to_string(),
            "framework": session.artifact.framework,
            "max_iterations": config.max_iterations,
            "unknown_tolerance": config.unknown_tolerance,
            "adapter_retry_budget": config.adapter_retry_budget,
            "todos": session.todos.as_ref().map(|t| t.id.clone()),
        }),
    ));

    for record in session.records() {
        items.push((
            AuditEntryKind::Iteration,
            Utc::now(),
            serde_json::to_value(record)?,
        ));
    }

    items.push((
        AuditEntryKind::Verdict,
        session.ended_at.unwrap_or_else(Utc::now),
        serde_json::json!({
            "verdict": session.verdict,
            "explanation": session.explanation,
            "records": session.records().len(),
            "patches_applied": session.patches_applied(),
            "final_fingerprint": session.artifact.fingerprint(),
        }),
    ));

    Ok(chain(&session.id, items))
}

/// Writes one audit file per session into a results directory.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    dir: PathBuf,
}

impl AuditTrail {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File name for a session:
    /// `{UTC timestamp}_{artifact slug}_{session id prefix}.jsonl`.
    ///
    /// The id prefix keeps sessions for same-named files in different
    /// directories apart.
    #[must_use]
    pub fn file_name(session: &HealingSession) -> String {
        let short_id: String = session.id.chars().filter(|c| *c != '-').take(8).collect();
        format!(
            "{}_{}_{}.jsonl",
            session.started_at.format("%Y%m%dT%H%M%S%3fZ"),
            session.artifact.slug(),
            short_id
        )
    }

    /// Write the session's audit file atomically. Returns its path.
    ///
    /// Never replaces an existing audit file.
    pub fn write(&self, session: &HealingSession, config: &HealConfig) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(session));
        let tmp_path = path.with_extension("jsonl.tmp");

        let mut content = String::new();
        for entry in session_entries(session, config)? {
            content.push_str(&serde_json::to_string(&entry)?);
            content.push('\n');
        }

        // Reserve the name; fails if another session already owns it.
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                HealError::Other(anyhow::anyhow!(
                    "refusing to overwrite audit trail {}: {e}",
                    path.display()
                ))
            })?;

        let write = || -> Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        debug!("Wrote audit trail to {}", path.display());
        Ok(path)
    }
}

/// Read every entry of an audit file.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.is_file() {
        return Err(HealError::MissingFile {
            path: path.to_path_buf(),
        });
    }
    let reader = BufReader::new(File::open(path)?);

    let mut entries = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
            HealError::Other(anyhow::anyhow!(
                "Failed to parse audit entry at line {}: {e}",
                line_num + 1
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Verify the integrity of an audit file.
///
/// Checks that:
/// 1. Sequence numbers are consecutive from zero
/// 2. Each entry's hash is correct
/// 3. Each entry's `previous_hash` matches the previous entry's hash
/// 4. The file starts with a session header and ends with a verdict
pub fn verify(path: &Path) -> Result<VerificationResult> {
    Ok(verify_entries(&read_entries(path)?))
}

/// Verify already-loaded entries.
#[must_use]
pub fn verify_entries(entries: &[AuditEntry]) -> VerificationResult {
    if entries.is_empty() {
        return VerificationResult::invalid(0, 0, "Audit file is empty");
    }

    let genesis = compute_genesis_hash();
    for (i, entry) in entries.iter().enumerate() {
        if entry.sequence != i as u64 {
            return VerificationResult::invalid(
                i as u64,
                entry.sequence,
                format!("Sequence mismatch: expected {}, got {}", i, entry.sequence),
            );
        }
        if !entry.verify_hash() {
            return VerificationResult::invalid(
                i as u64,
                entry.sequence,
                "Entry hash verification failed",
            );
        }
        let expected_previous = if i == 0 { &genesis } else { &entries[i - 1].hash };
        if entry.previous_hash != *expected_previous {
            return VerificationResult::invalid(
                i as u64,
                entry.sequence,
                "Chain broken: previous_hash does not match",
            );
        }
    }

    let last = entries.len() - 1;
    if entries[0].kind != AuditEntryKind::SessionStart {
        return VerificationResult::invalid(0, 0, "First entry is not a session header");
    }
    if entries[last].kind != AuditEntryKind::Verdict {
        return VerificationResult::invalid(
            last as u64,
            entries[last].sequence,
            "Last entry is not a verdict",
        );
    }

    VerificationResult::valid(entries.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::TestArtifact;
    use crate::framework::Framework;
    use crate::session::{ExecutionEntry, IterationRecord, Outcome, SessionVerdict};
    use crate::transcript::{ExecutionResult, Transcript};
    use std::time::Duration;
    use tempfile::TempDir;

    fn finished_session() -> HealingSession {
        let mut session = HealingSession::new(TestArtifact::new(
            "e2e/login.cy.js",
            "cy.visit('/')",
            Framework::Cypress,
        ));
        session.push_record(IterationRecord {
            iteration: 0,
            execution: ExecutionEntry::Result(ExecutionResult::pass(
                Transcript::new(),
                Duration::from_millis(12),
            )),
            diagnosis: None,
            patch: None,
            outcome: Outcome::Passed,
            fingerprint: session.artifact.fingerprint(),
            notes: Vec::new(),
        });
        session.finish(SessionVerdict::Healed, "test passed");
        session
    }

    #[test]
    fn test_write_and_verify() {
        let temp = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp.path().join("results"));
        let session = finished_session();

        let path = trail.write(&session, &HealConfig::default()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("_login.cy.js_"), "{name}");
        assert!(name.ends_with(".jsonl"));

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, AuditEntryKind::SessionStart);
        assert_eq!(entries[1].kind, AuditEntryKind::Iteration);
        assert_eq!(entries[2].data["verdict"], "healed");

        let result = verify(&path).unwrap();
        assert!(result.is_valid, "{:?}", result.error_description);
        assert_eq!(result.entries_verified, 3);
    }

    #[test]
    fn test_same_named_files_in_different_directories_get_separate_trails() {
        let temp = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp.path());
        let first = finished_session();
        let mut second = finished_session();
        second.artifact =
            TestArtifact::new("admin/login.cy.js", "cy.visit('/admin')", Framework::Cypress);
        second.started_at = first.started_at;
        assert_eq!(first.artifact.slug(), second.artifact.slug());

        let first_path = trail.write(&first, &HealConfig::default()).unwrap();
        let second_path = trail.write(&second, &HealConfig::default()).unwrap();

        assert_ne!(first_path, second_path);
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 2);
        assert!(verify(&first_path).unwrap().is_valid);
        assert!(verify(&second_path).unwrap().is_valid);
        let first_entries = read_entries(&first_path).unwrap();
        assert_eq!(first_entries[0].data["artifact"], "e2e/login.cy.js");
    }

    #[test]
    fn test_existing_trail_is_not_overwritten() {
        let temp = TempDir::new().unwrap();
        let trail = AuditTrail::new(temp.path());
        let session = finished_session();

        let path = trail.write(&session, &HealConfig::default()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(trail.write(&session, &HealConfig::default()).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_tampering_detected() {
        let temp = TempDir::new().unwrap();
        let path = AuditTrail::new(temp.path())
            .write(&finished_session(), &HealConfig::default())
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("test passed", "test skipped")).unwrap();

        let result = verify(&path).unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.first_invalid_entry, Some(2));
    }

    #[test]
    fn test_removed_line_detected() {
        let temp = TempDir::new().unwrap();
        let path = AuditTrail::new(temp.path())
            .write(&finished_session(), &HealConfig::default())
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(&path, kept.join("\n")).unwrap();

        assert!(!verify(&path).unwrap().is_valid);
    }

    #[test]
    fn test_missing_file() {
        let err = verify(Path::new("/nonexistent/audit.jsonl")).unwrap_err();
        assert!(matches!(err, HealError::MissingFile { .. }));
    }

    #[test]
    fn test_empty_entries_invalid() {
        assert!(!verify_entries(&[]).is_valid);
    }
}
