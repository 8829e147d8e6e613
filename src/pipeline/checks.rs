//! Aggregation of commit statuses and check suites into a single verdict.

use crate::types::{CheckStatus, CheckSuite, CombinedState, CombinedStatus};

/// Verdict for one polling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksVerdict {
    /// Everything reported has passed.
    Green,

    /// Something is still running or queued.
    Pending,

    /// A status or suite failed.
    Failing,

    /// The head has no statuses and no check suites at all.
    NoChecks,
}

/// Classifies one tick of check state.
///
/// Green requires the combined status to be success (or absent) AND every
/// check suite to have completed with a passing conclusion (success,
/// neutral, or skipped). Any failing conclusion or a failed combined status
/// is terminal for the run.
pub fn classify(combined: &CombinedStatus, suites: &[CheckSuite]) -> ChecksVerdict {
    if combined.state == CombinedState::Failure {
        return ChecksVerdict::Failing;
    }
    if suites.iter().any(suite_failed) {
        return ChecksVerdict::Failing;
    }

    let no_statuses = combined.state == CombinedState::None;
    if no_statuses && suites.is_empty() {
        return ChecksVerdict::NoChecks;
    }

    let statuses_green = matches!(combined.state, CombinedState::Success | CombinedState::None);
    let suites_green = suites.iter().all(suite_passed);
    if statuses_green && suites_green {
        ChecksVerdict::Green
    } else {
        ChecksVerdict::Pending
    }
}

fn suite_failed(suite: &CheckSuite) -> bool {
    suite.status == CheckStatus::Completed
        && suite.conclusion.is_some_and(|c| c.is_failing())
}

fn suite_passed(suite: &CheckSuite) -> bool {
    suite.status == CheckStatus::Completed
        && suite.conclusion.is_some_and(|c| c.is_passing())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckConclusion;

    fn combined(state: CombinedState, count: u32) -> CombinedStatus {
        CombinedStatus {
            state,
            total_count: count,
        }
    }

    #[test]
    fn all_green_is_green() {
        let suites = vec![CheckSuite::completed(CheckConclusion::Success)];
        assert_eq!(
            classify(&combined(CombinedState::Success, 1), &suites),
            ChecksVerdict::Green
        );
    }

    #[test]
    fn skipped_suites_count_as_green() {
        let suites = vec![
            CheckSuite::completed(CheckConclusion::Skipped),
            CheckSuite::completed(CheckConclusion::Skipped),
        ];
        assert_eq!(
            classify(&combined(CombinedState::Success, 1), &suites),
            ChecksVerdict::Green
        );
    }

    #[test]
    fn one_failed_suite_fails_even_among_skipped() {
        let suites = vec![
            CheckSuite::completed(CheckConclusion::Skipped),
            CheckSuite::completed(CheckConclusion::Failure),
        ];
        assert_eq!(
            classify(&combined(CombinedState::Success, 1), &suites),
            ChecksVerdict::Failing
        );
    }

    #[test]
    fn failed_combined_status_fails() {
        assert_eq!(
            classify(&combined(CombinedState::Failure, 2), &[]),
            ChecksVerdict::Failing
        );
    }

    #[test]
    fn running_suite_is_pending() {
        let suites = vec![CheckSuite::pending()];
        assert_eq!(
            classify(&combined(CombinedState::None, 0), &suites),
            ChecksVerdict::Pending
        );
    }

    #[test]
    fn pending_statuses_are_pending() {
        assert_eq!(
            classify(&combined(CombinedState::Pending, 1), &[]),
            ChecksVerdict::Pending
        );
    }

    #[test]
    fn nothing_reported_is_no_checks() {
        assert_eq!(
            classify(&CombinedStatus::none(), &[]),
            ChecksVerdict::NoChecks
        );
    }

    #[test]
    fn suites_green_with_no_statuses_is_green() {
        let suites = vec![CheckSuite::completed(CheckConclusion::Neutral)];
        assert_eq!(
            classify(&CombinedStatus::none(), &suites),
            ChecksVerdict::Green
        );
    }
}
