//! Configuration loading and validation.
//!
//! Configuration lives in `.mender/config.toml` under the project directory.
//! Every field has a default, so the file is optional. CLI flags override
//! file values, and [`HealConfig::validate`] runs once before any session
//! starts; after that the config is shared read-only.

use crate::error::{HealError, Result};
use crate::framework::{Framework, PATH_PLACEHOLDER};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of patch/re-execute cycles per session.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Default number of consecutive `unknown` diagnoses before aborting.
pub const DEFAULT_UNKNOWN_TOLERANCE: u32 = 1;

/// Default number of extra attempts for transient adapter failures.
pub const DEFAULT_ADAPTER_RETRY_BUDGET: u32 = 1;

/// Default execution timeout, ten minutes.
pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 600_000;

/// Default reasoning timeout.
pub const DEFAULT_REASONING_TIMEOUT_MS: u64 = 300_000;

/// Settings for the external reasoning capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Executable invoked with the prompt on stdin.
    #[serde(default = "default_reasoning_command")]
    pub command: String,

    /// Model variant passed through `--model`.
    #[serde(default = "default_reasoning_model")]
    pub model: String,
}

fn default_reasoning_command() -> String {
    "claude".to_string()
}

fn default_reasoning_model() -> String {
    "haiku".to_string()
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            command: default_reasoning_command(),
            model: default_reasoning_model(),
        }
    }
}

/// Immutable configuration for healing sessions.
///
/// # Example
///
/// ```
/// use mender::config::HealConfig;
///
/// let config = HealConfig::default().with_max_iterations(5);
/// assert_eq!(config.max_iterations, 5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Patch/re-execute cycles allowed after the initial execution.
    pub max_iterations: u32,
    /// Consecutive `unknown` diagnoses (or missing patches) tolerated
    /// before the session aborts. `0` disables the rule.
    pub unknown_tolerance: u32,
    /// Extra attempts for adapter infrastructure failures. These never
    /// consume healing iterations.
    pub adapter_retry_budget: u32,
    /// Base backoff between adapter retries, doubled per attempt.
    pub adapter_retry_backoff_ms: u64,
    /// Upper bound on a single test execution.
    pub execution_timeout_ms: u64,
    /// Upper bound on a single reasoning request.
    pub reasoning_timeout_ms: u64,
    /// Maximum characters of source/transcript context sent for reasoning.
    pub max_prompt_chars: usize,
    /// Maximum characters of previous failure output carried into a retry.
    pub max_output_chars: usize,
    /// Concurrent sessions for `heal-all`.
    pub workers: usize,
    /// Directory receiving one audit file per session.
    pub results_dir: PathBuf,
    /// Directory receiving planned todo lists.
    pub todo_dir: PathBuf,
    /// Framework used when it cannot be inferred from the file name.
    pub framework: Framework,
    /// Reasoning capability settings.
    pub reasoning: ReasoningConfig,
    /// Per-framework overrides of the invocation template, keyed by the
    /// framework name (`cypress`, `playwright-js`, `playwright-python`).
    pub templates: HashMap<String, String>,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            unknown_tolerance: DEFAULT_UNKNOWN_TOLERANCE,
            adapter_retry_budget: DEFAULT_ADAPTER_RETRY_BUDGET,
            adapter_retry_backoff_ms: 1_000,
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
            reasoning_timeout_ms: DEFAULT_REASONING_TIMEOUT_MS,
            max_prompt_chars: 15_000,
            max_output_chars: 10_000,
            workers: 2,
            results_dir: PathBuf::from(".mender/results"),
            todo_dir: PathBuf::from(".mender/todo"),
            framework: Framework::Cypress,
            reasoning: ReasoningConfig::default(),
            templates: HashMap::new(),
        }
    }
}

impl HealConfig {
    /// Load configuration from a project directory.
    ///
    /// Returns the defaults when no config file exists. Relative result and
    /// todo directories are resolved against the project directory.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::config_path(project_dir);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<HealConfig>(&content)
                .map_err(|e| HealError::config_with_path(e.to_string(), path.clone()))?
        } else {
            Self::default()
        };

        if config.results_dir.is_relative() {
            config.results_dir = project_dir.join(&config.results_dir);
        }
        if config.todo_dir.is_relative() {
            config.todo_dir = project_dir.join(&config.todo_dir);
        }
        Ok(config)
    }

    /// Get the config file path for a project
    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".mender/config.toml")
    }

    /// Serialize to TOML for display.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HealError::config(e.to_string()))
    }

    /// Validate the configuration. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(HealError::invalid_config(
                "max_iterations",
                "must allow at least one patch cycle",
            ));
        }
        if self.execution_timeout_ms == 0 {
            return Err(HealError::invalid_config(
                "execution_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.reasoning_timeout_ms == 0 {
            return Err(HealError::invalid_config(
                "reasoning_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.workers == 0 {
            return Err(HealError::invalid_config("workers", "must be at least 1"));
        }
        if self.max_prompt_chars < 1_000 {
            return Err(HealError::invalid_config(
                "max_prompt_chars",
                "must be at least 1000",
            ));
        }
        if self.reasoning.command.trim().is_empty() {
            return Err(HealError::invalid_config(
                "reasoning.command",
                "must not be empty",
            ));
        }
        for (framework, template) in &self.templates {
            if !Framework::ALL.iter().any(|f| f.to_string() == *framework) {
                return Err(HealError::invalid_config(
                    format!("templates.{framework}"),
                    "unknown framework",
                ));
            }
            if template.split_whitespace().next().is_none() {
                return Err(HealError::invalid_config(
                    format!("templates.{framework}"),
                    "template is empty",
                ));
            }
            if !template.contains(PATH_PLACEHOLDER) {
                return Err(HealError::invalid_config(
                    format!("templates.{framework}"),
                    format!("template must contain {PATH_PLACEHOLDER}"),
                ));
            }
        }
        Ok(())
    }

    /// Invocation template for a framework, honouring overrides.
    #[must_use]
    pub fn template_for(&self, framework: Framework) -> &str {
        self.templates
            .get(&framework.to_string())
            .map(String::as_str)
            .unwrap_or_else(|| framework.default_template())
    }

    /// Execution timeout as a `Duration`.
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Reasoning timeout as a `Duration`.
    #[must_use]
    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_millis(self.reasoning_timeout_ms)
    }

    /// Set the iteration budget.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the unknown-diagnosis tolerance.
    #[must_use]
    pub fn with_unknown_tolerance(mut self, tolerance: u32) -> Self {
        self.unknown_tolerance = tolerance;
        self
    }

    /// Set the adapter retry sub-budget.
    #[must_use]
    pub fn with_adapter_retry_budget(mut self, budget: u32) -> Self {
        self.adapter_retry_budget = budget;
        self
    }

    /// Set the adapter retry backoff.
    #[must_use]
    pub fn with_adapter_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.adapter_retry_backoff_ms = ms;
        self
    }

    /// Set the reasoning timeout.
    #[must_use]
    pub fn with_reasoning_timeout_ms(mut self, ms: u64) -> Self {
        self.reasoning_timeout_ms = ms;
        self
    }

    /// Set the number of concurrent workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the results directory.
    #[must_use]
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Set the todo directory.
    #[must_use]
    pub fn with_todo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.todo_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HealConfig::default();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.unknown_tolerance, 1);
        assert_eq!(config.adapter_retry_budget, 1);
        assert_eq!(config.execution_timeout(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = HealConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(config.results_dir, temp.path().join(".mender/results"));
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".mender")).unwrap();
        std::fs::write(
            HealConfig::config_path(temp.path()),
            r#"
max_iterations = 5
framework = "playwright-js"

[reasoning]
model = "sonnet"

[templates]
playwright-js = "npx playwright test --reporter=line {path}"
"#,
        )
        .unwrap();

        let config = HealConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.unknown_tolerance, 1);
        assert_eq!(config.framework, Framework::PlaywrightJs);
        assert_eq!(config.reasoning.model, "sonnet");
        assert_eq!(config.reasoning.command, "claude");
        assert_eq!(
            config.template_for(Framework::PlaywrightJs),
            "npx playwright test --reporter=line {path}"
        );
        assert_eq!(
            config.template_for(Framework::Cypress),
            Framework::Cypress.default_template()
        );
    }

    #[test]
    fn test_load_invalid_toml_is_config_error() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".mender")).unwrap();
        std::fs::write(HealConfig::config_path(temp.path()), "max_iterations = [").unwrap();

        let err = HealConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, HealError::Config { path: Some(_), .. }));
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let err = HealConfig::default()
            .with_max_iterations(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, HealError::InvalidConfig { ref field, .. } if field == "max_iterations"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        assert!(HealConfig::default().with_workers(0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_template_without_placeholder() {
        let mut config = HealConfig::default();
        config
            .templates
            .insert("cypress".to_string(), "yarn cypress run".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("templates.cypress"));
    }

    #[test]
    fn test_validate_rejects_unknown_framework_template() {
        let mut config = HealConfig::default();
        config
            .templates
            .insert("selenium".to_string(), "java -jar {path}".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_toml_round_trips_budget() {
        let config = HealConfig::default().with_max_iterations(4);
        let text = config.to_toml().unwrap();
        assert!(text.contains("max_iterations = 4"));
    }
}
