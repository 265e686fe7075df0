//! Scripted implementations of the adapter and reasoning seams.
//!
//! Each double answers from a queue of prepared results. Once the queue is
//! drained it keeps answering with the `repeat` result, if one was set.

use crate::adapter::ExecutionAdapter;
use crate::artifact::TestArtifact;
use crate::error::{HealError, Result};
use crate::reasoning::ReasoningClient;
use crate::transcript::ExecutionResult;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Rebuild an error so a scripted failure can be returned more than once.
fn replay(error: &HealError) -> HealError {
    match error {
        HealError::Adapter { message } => HealError::adapter(message.clone()),
        HealError::Reasoning { message } => HealError::reasoning(message.clone()),
        HealError::Extraction { message } => HealError::extraction(message.clone()),
        HealError::PatchConflict { path, anchor } => {
            HealError::patch_conflict(path.clone(), anchor.clone())
        }
        HealError::MalformedPatch { reason } => HealError::malformed_patch(reason.clone()),
        other => HealError::Other(anyhow::anyhow!("{other}")),
    }
}

fn replay_result<T: Clone>(result: &Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value.clone()),
        Err(e) => Err(replay(e)),
    }
}

/// A prepared sequence of answers.
struct Script<T> {
    queue: Mutex<VecDeque<Result<T>>>,
    repeat: Option<Result<T>>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            repeat: None,
        }
    }

    fn push(&mut self, result: Result<T>) {
        if let Ok(queue) = self.queue.get_mut() {
            queue.push_back(result);
        }
    }

    fn next(&self) -> Option<Result<T>> {
        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        queued.or_else(|| self.repeat.as_ref().map(replay_result))
    }
}

/// Execution adapter answering from a script.
///
/// # Example
///
/// ```rust,ignore
/// let adapter = ScriptedAdapter::new()
///     .then(Ok(selector_failure("#login")))
///     .then(Ok(passing()));
///
/// assert!(!adapter.execute(&artifact).await?.passed());
/// assert!(adapter.execute(&artifact).await?.passed());
/// assert_eq!(adapter.call_count(), 2);
/// ```
pub struct ScriptedAdapter {
    script: Script<ExecutionResult>,
    delay: Option<Duration>,
    on_call: Option<Box<dyn Fn() + Send + Sync>>,
    call_count: AtomicU32,
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAdapter {
    /// Create an adapter with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script::new(),
            delay: None,
            on_call: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Queue the next answer.
    #[must_use]
    pub fn then(mut self, result: Result<ExecutionResult>) -> Self {
        self.script.push(result);
        self
    }

    /// Answer used once the queue is drained.
    #[must_use]
    pub fn repeat(mut self, result: Result<ExecutionResult>) -> Self {
        self.script.repeat = Some(result);
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run a hook on every call, before answering.
    #[must_use]
    pub fn on_call(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    /// Number of times `execute` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionAdapter for ScriptedAdapter {
    async fn execute(&self, _artifact: &TestArtifact) -> Result<ExecutionResult> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_call {
            hook();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .next()
            .unwrap_or_else(|| Err(HealError::adapter("adapter script exhausted")))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Reasoning client answering from a script and recording every prompt.
pub struct ScriptedReasoner {
    script: Script<String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    call_count: AtomicU32,
}

impl Default for ScriptedReasoner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedReasoner {
    /// Create a reasoner with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script::new(),
            delay: None,
            prompts: Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
        }
    }

    /// Queue the next response.
    #[must_use]
    pub fn then(mut self, response: Result<String>) -> Self {
        self.script.push(response);
        self
    }

    /// Response used once the queue is drained.
    #[must_use]
    pub fn repeat(mut self, response: Result<String>) -> Self {
        self.script.repeat = Some(response);
        self
    }

    /// Sleep before answering, for timeout tests.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `run_prompt` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoner {
    async fn run_prompt(&self, prompt: &str) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .next()
            .unwrap_or_else(|| Err(HealError::reasoning("reasoning script exhausted")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Framework;
    use crate::testing::fixtures::{passing, selector_failure};

    fn artifact() -> TestArtifact {
        TestArtifact::new("a.cy.js", "cy.get('#a')", Framework::Cypress)
    }

    #[tokio::test]
    async fn test_adapter_answers_in_order_then_repeats() {
        let adapter = ScriptedAdapter::new()
            .then(Ok(selector_failure("#a")))
            .repeat(Ok(passing()));

        assert!(!adapter.execute(&artifact()).await.unwrap().passed());
        assert!(adapter.execute(&artifact()).await.unwrap().passed());
        assert!(adapter.execute(&artifact()).await.unwrap().passed());
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn test_adapter_repeats_errors() {
        let adapter = ScriptedAdapter::new().repeat(Err(HealError::adapter("crashed")));
        for _ in 0..2 {
            let err = adapter.execute(&artifact()).await.unwrap_err();
            assert!(err.is_recoverable());
        }
    }

    #[tokio::test]
    async fn test_empty_adapter_script_fails() {
        let adapter = ScriptedAdapter::new();
        assert!(adapter.execute(&artifact()).await.is_err());
    }

    #[tokio::test]
    async fn test_reasoner_records_prompts() {
        let reasoner = ScriptedReasoner::new().then(Ok("{}".to_string()));
        assert_eq!(reasoner.run_prompt("first").await.unwrap(), "{}");
        assert!(reasoner.run_prompt("second").await.is_err());
        assert_eq!(reasoner.prompts(), vec!["first", "second"]);
        assert_eq!(reasoner.call_count(), 2);
    }
}
