//! Concurrent healing of several artifacts.
//!
//! Sessions share nothing but the read-only controller. Concurrency is
//! bounded by a semaphore; sessions are returned in input order.

use crate::artifact::TestArtifact;
use crate::heal::controller::RetryController;
use crate::session::{HealingSession, SessionVerdict};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Heal every artifact with at most `workers` sessions in flight.
///
/// A session whose task panics is reported as aborted.
pub async fn heal_many(
    controller: Arc<RetryController>,
    artifacts: Vec<TestArtifact>,
    workers: usize,
) -> Vec<HealingSession> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));

    let handles: Vec<_> = artifacts
        .iter()
        .cloned()
        .map(|artifact| {
            let controller = Arc::clone(&controller);
            let semaphore = Arc::clone(&semaphore);

            tokio::spawn(async move {
                // never closed
                let _permit = semaphore.acquire_owned().await.ok();
                debug!(artifact = %artifact.path.display(), "Worker picked up artifact");
                controller.heal_artifact(artifact).await
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .zip(artifacts)
        .map(|(joined, artifact)| match joined {
            Ok(session) => session,
            Err(e) => {
                warn!(artifact = %artifact.path.display(), error = %e, "Session task failed");
                let mut session = HealingSession::new(artifact);
                session.finish(SessionVerdict::Aborted, format!("Session task failed: {e}"));
                session
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealConfig;
    use crate::testing::fixtures::{passing, write_artifact};
    use crate::testing::mocks::{ScriptedAdapter, ScriptedReasoner};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn controller(adapter: ScriptedAdapter) -> Arc<RetryController> {
        Arc::new(RetryController::new(
            Arc::new(HealConfig::default()),
            Arc::new(adapter),
            Arc::new(ScriptedReasoner::new()),
        ))
    }

    fn artifacts(temp: &TempDir, count: usize) -> Vec<TestArtifact> {
        (0..count)
            .map(|i| write_artifact(temp, &format!("spec{i}.cy.js"), "cy.visit('/')\n"))
            .collect()
    }

    #[tokio::test]
    async fn test_one_session_per_artifact_in_order() {
        let temp = TempDir::new().unwrap();
        let input = artifacts(&temp, 4);
        let paths: Vec<_> = input.iter().map(|a| a.path.clone()).collect();

        let sessions = heal_many(
            controller(ScriptedAdapter::new().repeat(Ok(passing()))),
            input,
            2,
        )
        .await;

        assert_eq!(sessions.len(), 4);
        for (session, path) in sessions.iter().zip(&paths) {
            assert_eq!(&session.artifact.path, path);
            assert_eq!(session.verdict, Some(SessionVerdict::Healed));
        }
    }

    #[tokio::test]
    async fn test_sessions_run_concurrently() {
        let temp = TempDir::new().unwrap();
        let adapter = ScriptedAdapter::new()
            .repeat(Ok(passing()))
            .with_delay(Duration::from_millis(200));

        let start = Instant::now();
        let sessions = heal_many(controller(adapter), artifacts(&temp, 4), 4).await;

        assert_eq!(sessions.len(), 4);
        assert!(start.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_zero_workers_still_progresses() {
        let temp = TempDir::new().unwrap();
        let sessions = heal_many(
            controller(ScriptedAdapter::new().repeat(Ok(passing()))),
            artifacts(&temp, 2),
            0,
        )
        .await;
        assert!(sessions.iter().all(|s| s.verdict == Some(SessionVerdict::Healed)));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let sessions = heal_many(controller(ScriptedAdapter::new()), Vec::new(), 2).await;
        assert!(sessions.is_empty());
    }
}
