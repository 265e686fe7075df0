//! Execution adapters.
//!
//! An [`ExecutionAdapter`] runs a test artifact once and reports a verdict
//! with its transcript. A failing test is a normal [`Verdict::Fail`]; only
//! infrastructure problems (runner missing, spawn failure, browser launch
//! failure, timeout) are errors.

use crate::artifact::TestArtifact;
use crate::config::HealConfig;
use crate::error::{HealError, Result};
use crate::framework::{render_template, Framework};
use crate::transcript::{ExecutionResult, Transcript, Verdict};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Output fragments that mean the browser or runner never started.
const LAUNCH_FAILURE_MARKERS: &[&str] = &[
    "Cypress failed to start",
    "Cypress could not verify that this server is running",
    "browserType.launch",
    "Executable doesn't exist at",
    "Failed to launch the browser process",
];

/// Runs a test artifact in its framework.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Execute the artifact once.
    async fn execute(&self, artifact: &TestArtifact) -> Result<ExecutionResult>;

    /// Human-readable adapter name for logs.
    fn name(&self) -> &str;
}

/// Adapter that runs the framework's invocation template as a subprocess.
///
/// # Example
///
/// ```rust,ignore
/// use mender::adapter::{CommandAdapter, ExecutionAdapter};
///
/// let adapter = CommandAdapter::from_config(&config, ".");
/// let result = adapter.execute(&artifact).await?;
/// ```
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    project_dir: PathBuf,
    templates: HashMap<Framework, String>,
    timeout: Duration,
}

impl CommandAdapter {
    /// Create an adapter using the default template for every framework.
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            templates: Framework::ALL
                .iter()
                .map(|f| (*f, f.default_template().to_string()))
                .collect(),
            timeout: HealConfig::default().execution_timeout(),
        }
    }

    /// Create an adapter from configuration (template overrides and timeout).
    #[must_use]
    pub fn from_config(config: &HealConfig, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            templates: Framework::ALL
                .iter()
                .map(|f| (*f, config.template_for(*f).to_string()))
                .collect(),
            timeout: config.execution_timeout(),
        }
    }

    /// Override the invocation template for one framework.
    #[must_use]
    pub fn with_template(mut self, framework: Framework, template: impl Into<String>) -> Self {
        self.templates.insert(framework, template.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn template(&self, framework: Framework) -> &str {
        self.templates
            .get(&framework)
            .map_or_else(|| framework.default_template(), String::as_str)
    }
}

#[async_trait]
impl ExecutionAdapter for CommandAdapter {
    async fn execute(&self, artifact: &TestArtifact) -> Result<ExecutionResult> {
        let template = self.template(artifact.framework);
        let (program, args) = render_template(template, &artifact.path).ok_or_else(|| {
            HealError::adapter(format!(
                "empty invocation template for {}",
                artifact.framework
            ))
        })?;

        if which::which(&program).is_err() {
            return Err(HealError::adapter(format!(
                "test runner `{program}` not found in PATH"
            )));
        }

        debug!(
            framework = %artifact.framework,
            program = %program,
            args = ?args,
            "Running test"
        );

        let start = Instant::now();
        let child = AsyncCommand::new(&program)
            .args(&args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HealError::adapter(format!("failed to spawn `{program}`: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(HealError::adapter(format!(
                    "failed to read output of `{program}`: {e}"
                )))
            }
            Err(_) => {
                return Err(HealError::adapter(format!(
                    "test run timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        };
        let duration = start.elapsed();

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            combined.push('\n');
            combined.push_str(&stderr);
        }

        if let Some(marker) = LAUNCH_FAILURE_MARKERS
            .iter()
            .find(|marker| combined.contains(*marker))
        {
            return Err(HealError::adapter(format!(
                "browser or runner failed to launch: {marker}"
            )));
        }

        let transcript = Transcript::from_output(&combined);
        let verdict = if output.status.success() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        debug!(
            verdict = %verdict,
            events = transcript.len(),
            duration_ms = duration.as_millis() as u64,
            "Test run finished"
        );

        Ok(ExecutionResult {
            verdict,
            transcript,
            duration,
        })
    }

    fn name(&self) -> &str {
        "command"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transcript::EventKind;
    use tempfile::TempDir;

    fn script(temp: &TempDir, body: &str) -> TestArtifact {
        let path = temp.path().join("spec.cy.js");
        std::fs::write(&path, body).unwrap();
        TestArtifact::load(&path, Framework::Cypress).unwrap()
    }

    fn shell_adapter(temp: &TempDir) -> CommandAdapter {
        CommandAdapter::new(temp.path()).with_template(Framework::Cypress, "sh {path}")
    }

    #[tokio::test]
    async fn test_passing_run() {
        let temp = TempDir::new().unwrap();
        let artifact = script(&temp, "echo 'all specs passed'\n");

        let result = shell_adapter(&temp).execute(&artifact).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.transcript.events[0].payload, "all specs passed");
    }

    #[tokio::test]
    async fn test_failing_run_is_a_verdict_not_an_error() {
        let temp = TempDir::new().unwrap();
        let artifact = script(
            &temp,
            "echo \"AssertionError: expected 'a' to equal 'b'\" >&2\nexit 1\n",
        );

        let result = shell_adapter(&temp).execute(&artifact).await.unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.transcript.events_of(EventKind::Error).count(), 1);
    }

    #[tokio::test]
    async fn test_missing_runner() {
        let temp = TempDir::new().unwrap();
        let artifact = script(&temp, "");
        let adapter = CommandAdapter::new(temp.path())
            .with_template(Framework::Cypress, "mender-no-such-runner {path}");

        let err = adapter.execute(&artifact).await.unwrap_err();
        assert!(matches!(err, HealError::Adapter { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_timeout_is_adapter_error() {
        let temp = TempDir::new().unwrap();
        let artifact = script(&temp, "sleep 5\n");
        let adapter = shell_adapter(&temp).with_timeout(Duration::from_millis(100));

        let err = adapter.execute(&artifact).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_browser_launch_failure() {
        let temp = TempDir::new().unwrap();
        let artifact = script(&temp, "echo 'Cypress failed to start.'\nexit 1\n");

        let err = shell_adapter(&temp).execute(&artifact).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_from_config_uses_overrides() {
        let mut config = HealConfig::default();
        config
            .templates
            .insert("playwright-js".to_string(), "pnpm exec playwright test {path}".to_string());
        let adapter = CommandAdapter::from_config(&config, ".");
        assert_eq!(
            adapter.template(Framework::PlaywrightJs),
            "pnpm exec playwright test {path}"
        );
        assert_eq!(adapter.template(Framework::PlaywrightPython), "pytest {path}");
    }
}
