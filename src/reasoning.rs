//! Reasoning capability and prompt construction.
//!
//! The reasoning capability proposes patches and plans. It is an external
//! collaborator invoked as a subprocess: a prompt goes in on stdin and a
//! free-form response (with an embedded JSON payload) comes back on stdout.
//! Callers bound each request with `tokio::time::timeout`.

use crate::artifact::TestArtifact;
use crate::config::ReasoningConfig;
use crate::diagnosis::Diagnosis;
use crate::error::{HealError, Result};
use crate::parse::truncate_tail;
use crate::todo::Todo;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// A prompt/response reasoning backend.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Send a prompt and return the raw response text.
    async fn run_prompt(&self, prompt: &str) -> Result<String>;

    /// Name of the model answering prompts.
    fn model_name(&self) -> &str;
}

/// Reasoning client that pipes prompts through the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeReasoner {
    /// Working directory for the CLI.
    project_dir: PathBuf,
    /// Executable to run.
    command: String,
    /// Model variant passed through `--model`.
    model: String,
}

impl ClaudeReasoner {
    /// Create a reasoner for the given project directory.
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let defaults = ReasoningConfig::default();
        Self {
            project_dir: project_dir.into(),
            command: defaults.command,
            model: defaults.model,
        }
    }

    /// Create a reasoner from configuration.
    #[must_use]
    pub fn from_config(config: &ReasoningConfig, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            command: config.command.clone(),
            model: config.model.clone(),
        }
    }

    /// Set the model variant to use.
    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }
}

#[async_trait]
impl ReasoningClient for ClaudeReasoner {
    async fn run_prompt(&self, prompt: &str) -> Result<String> {
        let args = [
            "-p",
            "--model",
            self.model.as_str(),
            "--output-format",
            "text",
        ];

        debug!(
            "Running {} with model {} ({} chars prompt)",
            self.command,
            self.model,
            prompt.len()
        );

        let mut child = match AsyncCommand::new(&self.command)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HealError::reasoning(format!(
                    "the '{}' CLI is not installed or not in PATH",
                    self.command
                )));
            }
            Err(e) => {
                return Err(HealError::reasoning(format!(
                    "failed to spawn {}: {e}",
                    self.command
                )));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| HealError::reasoning(format!("failed to write prompt: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| HealError::reasoning(format!("failed to flush prompt: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HealError::reasoning(format!("failed to read response: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HealError::reasoning(format!(
                "{} exited with code {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// Prompts
// =============================================================================

/// What the previous attempt produced, carried into the next patch request.
#[derive(Debug, Clone, Default)]
pub struct PreviousAttempt {
    /// Combined output of the last failing execution
    pub output: String,
    /// Rationale of the patch that did not fix the test
    pub rationale: Option<String>,
}

/// Everything needed to ask for a patch.
#[derive(Debug, Clone)]
pub struct PatchRequest<'a> {
    pub artifact: &'a TestArtifact,
    pub diagnosis: &'a Diagnosis,
    /// Text of the failing execution's transcript
    pub transcript: String,
    /// Accessibility snapshot captured at the point of failure
    pub snapshot: Option<String>,
    pub previous: Option<PreviousAttempt>,
    pub todo: Option<&'a Todo>,
}

/// Prompt size limits.
#[derive(Debug, Clone, Copy)]
pub struct PromptLimits {
    /// Characters kept from the source and transcript context
    pub max_prompt_chars: usize,
    /// Characters kept from the previous failure output
    pub max_output_chars: usize,
}

const PATCH_INSTRUCTIONS: &str = "\
You repair failing browser end-to-end tests. Change only the test file shown
below so that it matches the live page. Prefer targeted edits of the failing
selector or step; rewrite the whole file only when necessary.

Answer with one JSON object:
{\"rationale\": \"why the change fixes the failure\",
 \"file\": \"<the test file path>\",
 \"edits\": [{\"old_string\": \"exact text from the file\", \"new_string\": \"replacement\"}]}
or, for a full rewrite, {\"rationale\": \"...\", \"file\": \"...\", \"content\": \"<entire new file>\"}.
Every old_string must appear verbatim in the current file.";

const PLAN_INSTRUCTIONS: &str = "\
Read the browser end-to-end test below and break it into the ordered steps it
verifies. Classify each step as `ui` (browser interaction) or `api` (request
or backend check).

Answer with one JSON object:
{\"todos\": [{\"id\": 1, \"type\": \"ui\", \"description\": \"...\", \"status\": \"pending\"}],
 \"related_script_pathes\": [\"other files the test depends on\"]}";

/// Build the prompt asking for a patch.
#[must_use]
pub fn build_patch_prompt(request: &PatchRequest<'_>, limits: PromptLimits) -> String {
    let artifact = request.artifact;
    let diagnosis = request.diagnosis;

    let mut prompt = String::with_capacity(limits.max_prompt_chars + 2_000);
    prompt.push_str(PATCH_INSTRUCTIONS);

    prompt.push_str("\n\n## Diagnosis\n");
    prompt.push_str(&format!("- category: {}\n", diagnosis.category));
    if let Some(selector) = &diagnosis.selector {
        prompt.push_str(&format!("- failing selector: {selector}\n"));
    }
    prompt.push_str(&format!("- explanation: {}\n", diagnosis.explanation));
    if let Some(target) = &diagnosis.target_description {
        prompt.push_str(&format!("- intended element: {target}\n"));
    }

    if let Some(todo) = request.todo {
        prompt.push_str(&format!(
            "\n## Current step\n[{}] ({}) {}\n",
            todo.id, todo.kind, todo.description
        ));
    }

    prompt.push_str(&format!(
        "\n## Test file: {} ({})\n```{}\n{}\n```\n",
        artifact.path.display(),
        artifact.framework,
        artifact.framework.language(),
        truncate_tail(&artifact.source, limits.max_prompt_chars)
    ));

    prompt.push_str(&format!(
        "\n## Failure transcript\n```\n{}\n```\n",
        truncate_tail(&request.transcript, limits.max_prompt_chars)
    ));

    if let Some(snapshot) = &request.snapshot {
        prompt.push_str(&format!(
            "\n## Accessibility snapshot at failure\n```\n{}\n```\n",
            truncate_tail(snapshot, limits.max_prompt_chars)
        ));
    }

    if let Some(previous) = &request.previous {
        prompt.push_str("\n## Previous attempt\nThe last patch did not make the test pass.\n");
        if let Some(rationale) = &previous.rationale {
            prompt.push_str(&format!("Its rationale was: {rationale}\n"));
        }
        prompt.push_str(&format!(
            "Output of the failing run:\n```\n{}\n```\n\
             Look at the concrete error, the failing step, missing elements and \
             timing before adjusting the fix.\n",
            truncate_tail(&previous.output, limits.max_output_chars)
        ));
    }

    prompt
}

/// Build the prompt asking for a todo plan of a test.
#[must_use]
pub fn build_plan_prompt(artifact: &TestArtifact, max_prompt_chars: usize) -> String {
    format!(
        "{PLAN_INSTRUCTIONS}\n\ntarget file: {}\n```{}\n{}\n```\n",
        artifact.path.display(),
        artifact.framework.language(),
        truncate_tail(&artifact.source, max_prompt_chars)
    )
}
