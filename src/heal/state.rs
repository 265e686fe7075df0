//! Healing state machine states and transitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum adapter retry backoff in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Multiplier for exponential backoff.
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Calculate the exponential backoff before adapter retry `attempt`.
///
/// `attempt` is 1-indexed; the first retry waits `base_ms`.
///
/// ```
/// use mender::heal::state::calculate_backoff;
/// use std::time::Duration;
///
/// assert_eq!(calculate_backoff(1, 1000), Duration::from_millis(1000));
/// assert_eq!(calculate_backoff(3, 1000), Duration::from_millis(4000));
/// assert_eq!(calculate_backoff(10, 1000), Duration::from_millis(30_000));
/// ```
#[must_use]
pub fn calculate_backoff(attempt: u32, base_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier = BACKOFF_MULTIPLIER.saturating_pow(exponent);
    let delay = base_ms.saturating_mul(multiplier);
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// State of a healing session.
///
/// ```text
/// Init ──> Executing ──pass──> Healed
///              │
///             fail
///              ▼
///          Diagnosing ──budget spent──> Exhausted
///              │   └──extraction error / unknown──> Aborted
///              ▼
///           Patching ──conflict / malformed──> Aborted
///              │
///              ▼
///         ReExecuting ──> Executing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealState {
    Init,
    Executing,
    Diagnosing,
    Patching,
    ReExecuting,
    Healed,
    Exhausted,
    Aborted,
}

impl std::fmt::Display for HealState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Executing => "executing",
            Self::Diagnosing => "diagnosing",
            Self::Patching => "patching",
            Self::ReExecuting => "re-executing",
            Self::Healed => "healed",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

impl HealState {
    /// True for `Healed`, `Exhausted` and `Aborted`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healed | Self::Exhausted | Self::Aborted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Any non-terminal state may abort (cancellation, adapter failure).
    #[must_use]
    pub fn can_transition_to(&self, next: HealState) -> bool {
        use HealState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Aborted {
            return true;
        }
        matches!(
            (self, next),
            (Init, Executing)
                | (Executing, Healed)
                | (Executing, Diagnosing)
                | (Diagnosing, Exhausted)
                | (Diagnosing, Patching)
                | (Patching, Exhausted)
                | (Patching, ReExecuting)
                | (ReExecuting, Executing)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(HealState::Healed.is_terminal());
        assert!(HealState::Exhausted.is_terminal());
        assert!(HealState::Aborted.is_terminal());
        assert!(!HealState::Patching.is_terminal());
    }

    #[test]
    fn test_valid_cycle() {
        let cycle = [
            HealState::Init,
            HealState::Executing,
            HealState::Diagnosing,
            HealState::Patching,
            HealState::ReExecuting,
            HealState::Executing,
            HealState::Healed,
        ];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        // no re-execution without a patch
        assert!(!HealState::Diagnosing.can_transition_to(HealState::Executing));
        assert!(!HealState::Init.can_transition_to(HealState::Patching));
        assert!(!HealState::Healed.can_transition_to(HealState::Executing));
        assert!(!HealState::Aborted.can_transition_to(HealState::Aborted));
        assert!(HealState::Patching.can_transition_to(HealState::Aborted));
    }

    #[test]
    fn test_backoff_zero_base() {
        assert_eq!(calculate_backoff(2, 0), Duration::ZERO);
    }

    #[test]
    fn test_display() {
        assert_eq!(HealState::ReExecuting.to_string(), "re-executing");
    }
}
