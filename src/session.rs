//! Healing sessions and their iteration records.

use crate::artifact::TestArtifact;
use crate::diagnosis::Diagnosis;
use crate::heal::state::HealState;
use crate::patch::Patch;
use crate::todo::TodoList;
use crate::transcript::ExecutionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final verdict of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionVerdict {
    /// The test passes
    Healed,
    /// The iteration budget ran out while the test still fails
    Exhausted,
    /// The session stopped early (unfixable, unsafe or cancelled)
    Aborted,
}

impl std::fmt::Display for SessionVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healed => write!(f, "healed"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl SessionVerdict {
    /// Process exit code for this verdict.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Healed => 0,
            Self::Exhausted => 3,
            Self::Aborted => 4,
        }
    }

    /// Terminal state matching this verdict.
    #[must_use]
    pub fn state(&self) -> HealState {
        match self {
            Self::Healed => HealState::Healed,
            Self::Exhausted => HealState::Exhausted,
            Self::Aborted => HealState::Aborted,
        }
    }
}

/// What came of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// The execution passed
    Passed,
    /// The failure was diagnosed and a patch committed
    Patched,
    /// The failure was diagnosed but the budget was already spent
    BudgetSpent,
    /// No usable patch was produced before the budget ran out
    NoPatch,
    /// The session stopped in this iteration
    Aborted,
}

/// Execution half of a record: the result, or the adapter error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEntry {
    Result(ExecutionResult),
    AdapterError(String),
}

/// One Execute-Diagnose-Patch cycle. Records are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub execution: ExecutionEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
    pub outcome: Outcome,
    /// MD5 of the artifact source when the iteration started
    pub fingerprint: String,
    /// Reasoning failures and other remarks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl IterationRecord {
    /// True when this record's execution passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(&self.execution, ExecutionEntry::Result(r) if r.passed())
    }

    /// The execution result, if the adapter produced one.
    #[must_use]
    pub fn result(&self) -> Option<&ExecutionResult> {
        match &self.execution {
            ExecutionEntry::Result(r) => Some(r),
            ExecutionEntry::AdapterError(_) => None,
        }
    }
}

/// One healing run over one artifact.
#[derive(Debug, Clone)]
pub struct HealingSession {
    pub id: String,
    pub artifact: TestArtifact,
    records: Vec<IterationRecord>,
    pub state: HealState,
    pub verdict: Option<SessionVerdict>,
    pub explanation: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Completed Execute-Diagnose-Patch cycles plus reasoning failures
    pub iteration: u32,
    /// Consecutive unknown diagnoses or missing patches
    pub consecutive_unknown: u32,
    /// Planned steps driving the patch requests, if any
    pub todos: Option<TodoList>,
}

impl HealingSession {
    /// Start a session for an artifact.
    #[must_use]
    pub fn new(artifact: TestArtifact) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            artifact,
            records: Vec::new(),
            state: HealState::Init,
            verdict: None,
            explanation: None,
            started_at: Utc::now(),
            ended_at: None,
            iteration: 0,
            consecutive_unknown: 0,
            todos: None,
        }
    }

    /// Attach a todo list.
    #[must_use]
    pub fn with_todos(mut self, todos: TodoList) -> Self {
        self.todos = Some(todos);
        self
    }

    /// Records in order.
    #[must_use]
    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    /// Append a record.
    pub fn push_record(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Close the session with a verdict. Has no effect on a closed session.
    pub fn finish(&mut self, verdict: SessionVerdict, explanation: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.state = verdict.state();
        self.verdict = Some(verdict);
        self.explanation = Some(explanation.into());
        self.ended_at = Some(Utc::now());
        if let Some(todos) = &mut self.todos {
            todos.finish(verdict == SessionVerdict::Healed);
        }
    }

    /// Number of patches committed.
    #[must_use]
    pub fn patches_applied(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome == Outcome::Patched)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Framework;
    use crate::todo::{Todo, TodoKind, TodoStatus};
    use crate::transcript::Transcript;
    use std::time::Duration;

    fn session() -> HealingSession {
        HealingSession::new(TestArtifact::new("a.cy.js", "x", Framework::Cypress))
    }

    #[test]
    fn test_verdict_exit_codes() {
        assert_eq!(SessionVerdict::Healed.exit_code(), 0);
        assert_eq!(SessionVerdict::Exhausted.exit_code(), 3);
        assert_eq!(SessionVerdict::Aborted.exit_code(), 4);
    }

    #[test]
    fn test_finish_is_final() {
        let mut session = session();
        session.finish(SessionVerdict::Healed, "passed");
        session.finish(SessionVerdict::Aborted, "late");
        assert_eq!(session.verdict, Some(SessionVerdict::Healed));
        assert_eq!(session.state, HealState::Healed);
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_finish_updates_todos() {
        let mut todos = TodoList::new("a");
        todos
            .todos
            .push(Todo::new(1, TodoKind::Ui, "step").with_status(TodoStatus::InProgress));
        let mut session = session().with_todos(todos);
        session.finish(SessionVerdict::Exhausted, "budget");
        assert_eq!(
            session.todos.as_ref().unwrap().todos[0].status,
            TodoStatus::Failed
        );
    }

    #[test]
    fn test_record_passed() {
        let record = IterationRecord {
            iteration: 0,
            execution: ExecutionEntry::Result(ExecutionResult::pass(
                Transcript::new(),
                Duration::from_millis(5),
            )),
            diagnosis: None,
            patch: None,
            outcome: Outcome::Passed,
            fingerprint: String::new(),
            notes: Vec::new(),
        };
        assert!(record.passed());

        let failed = IterationRecord {
            execution: ExecutionEntry::AdapterError("yarn missing".to_string()),
            outcome: Outcome::Aborted,
            ..record
        };
        assert!(!failed.passed());
        assert!(failed.result().is_none());
    }
}
