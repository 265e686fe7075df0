//! mender - self-healing retry loop for browser end-to-end tests
//!
//! Runs a failing Cypress or Playwright test, diagnoses the failure from
//! the runner transcript, asks a reasoning model for a patch, applies it
//! atomically and re-runs the test until it passes or the retry budget is
//! spent. Every session leaves a hash-chained audit trail.
//!
//! # Architecture
//!
//! - [`heal`] - the retry controller state machine and the worker pool
//! - [`adapter`] - test execution behind the [`ExecutionAdapter`] trait
//! - [`diagnosis`] - transcript → structured [`Diagnosis`]
//! - [`reasoning`] - patch and plan prompts behind [`ReasoningClient`]
//! - [`patch`] - patch parsing and atomic application
//! - [`todo`] - planned verification steps
//! - [`audit`] - per-session JSONL audit trail
//! - [`config`] - configuration loading and validation
//! - [`error`] - custom error types and handling
//! - [`testing`] - scripted test doubles and fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::{ClaudeReasoner, CommandAdapter, HealConfig, RetryController, TestArtifact};
//! use std::sync::Arc;
//!
//! let config = HealConfig::load(".".as_ref())?;
//! config.validate()?;
//! let adapter = Arc::new(CommandAdapter::from_config(&config, "."));
//! let reasoner = Arc::new(ClaudeReasoner::from_config(&config.reasoning, "."));
//! let controller = RetryController::new(Arc::new(config), adapter, reasoner);
//!
//! let artifact = TestArtifact::load("cypress/e2e/login.cy.js", Framework::Cypress)?;
//! let session = controller.heal_artifact(artifact).await;
//! println!("{:?}: {:?}", session.verdict, session.explanation);
//! ```

pub mod adapter;
pub mod artifact;
pub mod audit;
pub mod config;
pub mod diagnosis;
pub mod error;
pub mod framework;
pub mod heal;
pub mod parse;
pub mod patch;
pub mod reasoning;
pub mod session;
pub mod testing;
pub mod todo;
pub mod transcript;

// Re-export commonly used types
pub use error::{HealError, Result};

pub use adapter::{CommandAdapter, ExecutionAdapter};
pub use artifact::TestArtifact;
pub use audit::{AuditEntry, AuditEntryKind, AuditTrail, VerificationResult};
pub use config::{HealConfig, ReasoningConfig};
pub use diagnosis::{Diagnosis, DiagnosisExtractor, FailureCategory};
pub use framework::Framework;
pub use heal::{heal_many, HealState, RetryController};
pub use patch::{EditOp, Patch, PatchApplicator, PatchEdit};
pub use reasoning::{ClaudeReasoner, ReasoningClient};
pub use session::{HealingSession, IterationRecord, Outcome, SessionVerdict};
pub use todo::{Todo, TodoKind, TodoList, TodoStatus};
pub use transcript::{EventKind, ExecutionResult, SessionEvent, Transcript, Verdict};

// Re-export cancellation for callers driving the controller
pub use tokio_util::sync::CancellationToken;
