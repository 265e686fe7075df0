//! Fixtures for controller and pool tests.

use crate::artifact::TestArtifact;
use crate::framework::Framework;
use crate::transcript::{ExecutionResult, Transcript};
use std::time::Duration;
use tempfile::TempDir;

/// Write a test file into `dir` and load it as an artifact.
///
/// The framework is inferred from the file name, falling back to Cypress.
///
/// # Panics
///
/// Panics if the file cannot be written.
#[must_use]
pub fn write_artifact(dir: &TempDir, name: &str, source: &str) -> TestArtifact {
    let path = dir.path().join(name);
    std::fs::write(&path, source).expect("Failed to write test artifact");
    let framework = Framework::infer(&path).unwrap_or(Framework::Cypress);
    TestArtifact::load(&path, framework).expect("Failed to load test artifact")
}

/// A passing execution.
#[must_use]
pub fn passing() -> ExecutionResult {
    ExecutionResult::pass(
        Transcript::from_output("  ✓ logs in (812ms)\n\n  1 passing (1s)\n"),
        Duration::from_millis(1_000),
    )
}

/// A failing execution whose output is the given lines.
#[must_use]
pub fn failing(lines: &[&str]) -> ExecutionResult {
    ExecutionResult::fail(
        Transcript::from_output(&lines.join("\n")),
        Duration::from_millis(1_000),
    )
}

/// A Cypress run that could not find `selector`.
#[must_use]
pub fn selector_failure(selector: &str) -> ExecutionResult {
    let error = format!(
        "CypressError: Timed out retrying after 4000ms: Expected to find element: `{selector}`, but never found it."
    );
    failing(&["  1) logs in", &error, "  0 passing (5s)", "  1 failing"])
}

/// A failure no rule recognizes.
#[must_use]
pub fn unknown_failure() -> ExecutionResult {
    failing(&[
        "  1) adds item to cart",
        "TypeError: Cannot read properties of undefined (reading 'id')",
    ])
}
