//! Commit status and check suite types.
//!
//! These model the two signals the platform exposes for a head SHA: the
//! legacy combined commit status and the check suites. The pipeline
//! aggregates both into a single green/pending/failing verdict.

use serde::{Deserialize, Serialize};

/// Aggregate state of the legacy combined commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinedState {
    Success,
    Pending,
    Failure,
    /// No statuses have been reported for the SHA at all.
    None,
}

/// The combined commit status for a head SHA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedStatus {
    pub state: CombinedState,
    /// Number of individual status contexts reported.
    pub total_count: u32,
}

impl CombinedStatus {
    pub fn none() -> Self {
        CombinedStatus {
            state: CombinedState::None,
            total_count: 0,
        }
    }
}

/// Lifecycle state of a check suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
    #[serde(other)]
    Unknown,
}

/// Conclusion of a completed check suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Neutral,
    Skipped,
    Failure,
    TimedOut,
    Cancelled,
    ActionRequired,
    Stale,
    StartupFailure,
    #[serde(other)]
    Unknown,
}

impl CheckConclusion {
    /// Conclusions that count as passing: success, neutral, and skipped.
    pub fn is_passing(&self) -> bool {
        matches!(
            self,
            CheckConclusion::Success | CheckConclusion::Neutral | CheckConclusion::Skipped
        )
    }

    /// Conclusions that definitively fail the run.
    pub fn is_failing(&self) -> bool {
        matches!(
            self,
            CheckConclusion::Failure
                | CheckConclusion::TimedOut
                | CheckConclusion::Cancelled
                | CheckConclusion::ActionRequired
                | CheckConclusion::StartupFailure
        )
    }
}

/// A single check suite reported for a head SHA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSuite {
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
}

impl CheckSuite {
    pub fn completed(conclusion: CheckConclusion) -> Self {
        CheckSuite {
            status: CheckStatus::Completed,
            conclusion: Some(conclusion),
        }
    }

    pub fn pending() -> Self {
        CheckSuite {
            status: CheckStatus::InProgress,
            conclusion: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_and_neutral_count_as_passing() {
        assert!(CheckConclusion::Success.is_passing());
        assert!(CheckConclusion::Neutral.is_passing());
        assert!(CheckConclusion::Skipped.is_passing());
        assert!(!CheckConclusion::Failure.is_passing());
    }

    #[test]
    fn failing_conclusions() {
        for c in [
            CheckConclusion::Failure,
            CheckConclusion::TimedOut,
            CheckConclusion::Cancelled,
            CheckConclusion::ActionRequired,
            CheckConclusion::StartupFailure,
        ] {
            assert!(c.is_failing(), "{c:?} should fail the run");
            assert!(!c.is_passing());
        }
        assert!(!CheckConclusion::Stale.is_failing());
        assert!(!CheckConclusion::Unknown.is_failing());
    }
}
