//! The retry controller: Execute → Diagnose → Patch → Re-execute.
//!
//! The controller owns all cross-iteration state of a session (iteration
//! counter, consecutive-unknown counter, history) and guarantees
//! termination: every path through [`RetryController::heal`] ends in
//! `Healed`, `Exhausted` or `Aborted`. Loop errors never escape; they
//! become the session's verdict and explanation.

use crate::adapter::ExecutionAdapter;
use crate::artifact::TestArtifact;
use crate::config::HealConfig;
use crate::diagnosis::{Diagnosis, DiagnosisExtractor};
use crate::error::{HealError, Result};
use crate::heal::state::{calculate_backoff, HealState};
use crate::patch::{parse_patch_response, Patch, PatchApplicator};
use crate::reasoning::{build_patch_prompt, PatchRequest, PreviousAttempt, PromptLimits, ReasoningClient};
use crate::session::{
    ExecutionEntry, HealingSession, IterationRecord, Outcome, SessionVerdict,
};
use crate::transcript::ExecutionResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives healing sessions to a terminal verdict.
///
/// # Example
///
/// ```rust,ignore
/// use mender::heal::RetryController;
///
/// let controller = RetryController::new(config, adapter, reasoner);
/// let session = controller.heal_artifact(artifact).await;
/// println!("{:?}", session.verdict);
/// ```
pub struct RetryController {
    config: Arc<HealConfig>,
    adapter: Arc<dyn ExecutionAdapter>,
    reasoner: Arc<dyn ReasoningClient>,
    extractor: DiagnosisExtractor,
    applicator: PatchApplicator,
    cancel: CancellationToken,
}

impl RetryController {
    /// Create a controller. The config is shared read-only.
    pub fn new(
        config: Arc<HealConfig>,
        adapter: Arc<dyn ExecutionAdapter>,
        reasoner: Arc<dyn ReasoningClient>,
    ) -> Self {
        Self {
            config,
            adapter,
            reasoner,
            extractor: DiagnosisExtractor::new(),
            applicator: PatchApplicator::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels every session this controller runs.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn config(&self) -> &HealConfig {
        &self.config
    }

    /// Run a fresh session for an artifact.
    pub async fn heal_artifact(&self, artifact: TestArtifact) -> HealingSession {
        let mut session = HealingSession::new(artifact);
        self.heal(&mut session).await;
        session
    }

    /// Drive a session until it reaches a terminal state.
    ///
    /// Calling this on a terminal session does nothing.
    pub async fn heal(&self, session: &mut HealingSession) {
        if session.is_terminal() {
            debug!(
                session = %session.id,
                state = %session.state,
                "Session already finished"
            );
            return;
        }

        info!(
            session = %session.id,
            artifact = %session.artifact.path.display(),
            framework = %session.artifact.framework,
            budget = self.config.max_iterations,
            "Healing session started"
        );
        if session.state == HealState::Init {
            transition(session, HealState::Executing);
        }

        let mut previous: Option<PreviousAttempt> = None;
        loop {
            if self.check_cancelled(session, None) {
                return;
            }

            let iteration = session.iteration;
            let fingerprint = session.artifact.fingerprint();
            info!(
                session = %session.id,
                iteration,
                fingerprint = %fingerprint,
                "Executing test"
            );

            let result = match self.execute_with_retries(&session.artifact).await {
                Ok(result) => result,
                Err(e) => {
                    session.push_record(IterationRecord {
                        iteration,
                        execution: ExecutionEntry::AdapterError(e.to_string()),
                        diagnosis: None,
                        patch: None,
                        outcome: Outcome::Aborted,
                        fingerprint,
                        notes: Vec::new(),
                    });
                    abort(session, format!("Execution failed: {e}"));
                    return;
                }
            };

            let mut record = IterationRecord {
                iteration,
                execution: ExecutionEntry::Result(result.clone()),
                diagnosis: None,
                patch: None,
                outcome: Outcome::Aborted,
                fingerprint,
                notes: Vec::new(),
            };

            if result.passed() {
                record.outcome = Outcome::Passed;
                session.push_record(record);
                finish(session, SessionVerdict::Healed, "Test passed");
                return;
            }

            transition(session, HealState::Diagnosing);
            if self.check_cancelled(session, Some(&mut record)) {
                return;
            }

            let diagnosis = match self
                .extractor
                .extract(&result.transcript, &session.artifact.source)
            {
                Ok(diagnosis) => diagnosis,
                Err(e) => {
                    session.push_record(record);
                    abort(session, e.to_string());
                    return;
                }
            };
            record.diagnosis = Some(diagnosis.clone());
            info!(
                session = %session.id,
                category = %diagnosis.category,
                selector = ?diagnosis.selector,
                "Failure diagnosed"
            );

            if diagnosis.category.is_unknown() {
                session.consecutive_unknown += 1;
                if let Some(e) = self.unknown_limit(session) {
                    session.push_record(record);
                    abort(session, e.to_string());
                    return;
                }
            } else {
                session.consecutive_unknown = 0;
            }

            if session.iteration >= self.config.max_iterations {
                record.outcome = Outcome::BudgetSpent;
                session.push_record(record);
                let e = HealError::Exhausted {
                    budget: self.config.max_iterations,
                };
                finish(session, SessionVerdict::Exhausted, e.to_string());
                return;
            }

            transition(session, HealState::Patching);
            let todo = session.todos.as_mut().and_then(|t| t.start_next());

            loop {
                if self.check_cancelled(session, Some(&mut record)) {
                    return;
                }

                let prompt = {
                    let request = PatchRequest {
                        artifact: &session.artifact,
                        diagnosis: &diagnosis,
                        transcript: result.transcript.text(),
                        snapshot: result.transcript.last_snapshot().map(str::to_string),
                        previous: previous.clone(),
                        todo: todo.as_ref(),
                    };
                    build_patch_prompt(&request, self.prompt_limits())
                };

                match self.request_patch(&prompt, &diagnosis).await {
                    Ok(patch) => match self.applicator.apply(&mut session.artifact, &patch) {
                        Ok(applied) => {
                            info!(
                                session = %session.id,
                                patch = %patch.id,
                                before = %applied.before,
                                after = %applied.after,
                                "Patch applied"
                            );
                            previous = Some(PreviousAttempt {
                                output: result.transcript.text(),
                                rationale: Some(patch.rationale.clone()),
                            });
                            record.patch = Some(patch);
                            record.outcome = Outcome::Patched;
                            break;
                        }
                        Err(e) => {
                            warn!(session = %session.id, error = %e, "Patch rejected");
                            record.patch = Some(patch);
                            session.push_record(record);
                            abort(session, e.to_string());
                            return;
                        }
                    },
                    Err(e) if e.is_patch_failure() => {
                        warn!(session = %session.id, error = %e, "Patch rejected");
                        session.push_record(record);
                        abort(session, e.to_string());
                        return;
                    }
                    Err(e) => {
                        warn!(session = %session.id, error = %e, "No patch produced");
                        record.notes.push(e.to_string());
                        session.consecutive_unknown += 1;
                        if let Some(limit) = self.unknown_limit(session) {
                            session.push_record(record);
                            abort(session, format!("{limit}: {e}"));
                            return;
                        }
                        session.iteration += 1;
                        if session.iteration >= self.config.max_iterations {
                            record.outcome = Outcome::NoPatch;
                            session.push_record(record);
                            let exhausted = HealError::Exhausted {
                                budget: self.config.max_iterations,
                            };
                            finish(session, SessionVerdict::Exhausted, exhausted.to_string());
                            return;
                        }
                        debug!(session = %session.id, "Re-requesting patch");
                    }
                }
            }

            session.push_record(record);
            transition(session, HealState::ReExecuting);
            session.iteration += 1;
            transition(session, HealState::Executing);
        }
    }

    /// Run the adapter, retrying infrastructure failures with backoff.
    ///
    /// Retries never consume healing iterations.
    async fn execute_with_retries(&self, artifact: &TestArtifact) -> Result<ExecutionResult> {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(
                self.config.execution_timeout(),
                self.adapter.execute(artifact),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(HealError::adapter(format!(
                    "{} adapter timed out after {}ms",
                    self.adapter.name(),
                    self.config.execution_timeout_ms
                ))),
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if e.is_recoverable() && attempt < self.config.adapter_retry_budget => {
                    attempt += 1;
                    let delay = calculate_backoff(attempt, self.config.adapter_retry_backoff_ms);
                    warn!(
                        error = %e,
                        attempt,
                        budget = self.config.adapter_retry_budget,
                        delay_ms = delay.as_millis() as u64,
                        "Adapter failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask the reasoning capability for a patch, bounded by the timeout.
    async fn request_patch(&self, prompt: &str, diagnosis: &Diagnosis) -> Result<Patch> {
        let response = match tokio::time::timeout(
            self.config.reasoning_timeout(),
            self.reasoner.run_prompt(prompt),
        )
        .await
        {
            Ok(response) => response?,
            Err(_) => {
                return Err(HealError::reasoning(format!(
                    "{} timed out after {}ms",
                    self.reasoner.model_name(),
                    self.config.reasoning_timeout_ms
                )))
            }
        };
        parse_patch_response(&response, &diagnosis.id)
    }

    fn prompt_limits(&self) -> PromptLimits {
        PromptLimits {
            max_prompt_chars: self.config.max_prompt_chars,
            max_output_chars: self.config.max_output_chars,
        }
    }

    fn unknown_limit(&self, session: &HealingSession) -> Option<HealError> {
        let tolerance = self.config.unknown_tolerance;
        (tolerance > 0 && session.consecutive_unknown >= tolerance).then_some(
            HealError::UnknownDiagnosis {
                count: session.consecutive_unknown,
                tolerance,
            },
        )
    }

    /// Abort the session if cancellation was requested.
    ///
    /// A pending record is appended first so the execution stays audited.
    fn check_cancelled(
        &self,
        session: &mut HealingSession,
        record: Option<&mut IterationRecord>,
    ) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        if let Some(record) = record {
            record.outcome = Outcome::Aborted;
            session.push_record(record.clone());
        }
        abort(session, "Cancelled");
        true
    }
}

fn transition(session: &mut HealingSession, next: HealState) {
    if !session.state.can_transition_to(next) {
        warn!(
            session = %session.id,
            from = %session.state,
            to = %next,
            "Unexpected state transition"
        );
    }
    debug!(session = %session.id, from = %session.state, to = %next, "State transition");
    session.state = next;
}

fn finish(session: &mut HealingSession, verdict: SessionVerdict, explanation: impl Into<String>) {
    let explanation = explanation.into();
    debug!(
        session = %session.id,
        from = %session.state,
        to = %verdict.state(),
        "State transition"
    );
    session.finish(verdict, explanation.clone());
    info!(
        session = %session.id,
        verdict = %verdict,
        records = session.records().len(),
        explanation = %explanation,
        "Healing session finished"
    );
}

fn abort(session: &mut HealingSession, explanation: impl Into<String>) {
    finish(session, SessionVerdict::Aborted, explanation);
}
