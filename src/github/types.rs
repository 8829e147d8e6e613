//! Wire DTOs for the REST API and the facade's typed outcomes.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::types::{
    CheckConclusion, CheckStatus, CheckSuite, CombinedState, CombinedStatus, MergeableState,
    PrNumber, PrSnapshot, PrState, Sha,
};

use super::error::ApiError;

/// Outcome of an update-branch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateBranchOutcome {
    /// Accepted; the platform will synthesize a new head commit.
    Ok,

    /// The head was already up to date with its base.
    NotBehind,

    /// The update could not be performed (merge conflict against base).
    Conflict,
}

impl UpdateBranchOutcome {
    /// Label for the `branch_updates_total` metric.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateBranchOutcome::Ok => "ok",
            UpdateBranchOutcome::NotBehind => "not_behind",
            UpdateBranchOutcome::Conflict => "conflict",
        }
    }
}

/// Outcome of a merge request. These are results, not errors: the pipeline
/// decides what each one means for the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,

    /// The head moved since eligibility was evaluated; the guard SHA no
    /// longer matches.
    MismatchedSha,

    /// The platform refuses the merge (conflict, protection state change).
    NotMergeable,

    /// The installation may not merge this PR.
    Forbidden,
}

/// The remote quota snapshot surfaced after every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Parses `x-ratelimit-remaining` / `x-ratelimit-reset` header values.
pub fn parse_rate_limit(remaining: Option<&str>, reset: Option<&str>) -> Option<RateLimitSnapshot> {
    let remaining = remaining?.trim().parse().ok()?;
    let reset_at = reset
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
    Some(RateLimitSnapshot {
        remaining,
        reset_at,
    })
}

// ─── Wire DTOs ───

#[derive(Debug, Deserialize)]
pub struct PullResponse {
    pub number: u64,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub labels: Vec<LabelResponse>,
    pub head: GitRefResponse,
    pub base: GitRefResponse,
    pub mergeable: Option<bool>,
    pub mergeable_state: Option<String>,
    pub user: Option<UserResponse>,
    #[serde(default)]
    pub title: String,
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LabelResponse {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GitRefResponse {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UserResponse {
    pub login: String,
}

impl PullResponse {
    /// Converts the wire form into a typed snapshot. `behind_by` is filled
    /// in separately (compare endpoint) when the PR reports itself behind.
    pub fn into_snapshot(self, behind_by: u32) -> Result<PrSnapshot, ApiError> {
        let head_sha = Sha::parse(&self.head.sha)
            .map_err(|e| ApiError::Decode(format!("bad head sha: {e}")))?;
        let state = match self.state.as_str() {
            "open" => PrState::Open,
            _ => PrState::Closed,
        };
        Ok(PrSnapshot {
            number: PrNumber(self.number),
            state,
            draft: self.draft,
            locked: self.locked,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            head_sha,
            head_ref: self.head.ref_name,
            base_ref: self.base.ref_name,
            mergeable: self.mergeable,
            mergeable_state: self
                .mergeable_state
                .as_deref()
                .map(MergeableState::from_api)
                .unwrap_or(MergeableState::Unknown),
            user: self.user.map(|u| u.login),
            title: self.title,
            body: self.body,
            behind_by,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CombinedStatusResponse {
    pub state: String,
    #[serde(default)]
    pub total_count: u32,
}

impl CombinedStatusResponse {
    pub fn into_status(self) -> CombinedStatus {
        // Zero reported contexts means "no statuses", which GitHub surfaces
        // as a pending combined state.
        let state = if self.total_count == 0 {
            CombinedState::None
        } else {
            match self.state.as_str() {
                "success" => CombinedState::Success,
                "failure" | "error" => CombinedState::Failure,
                _ => CombinedState::Pending,
            }
        };
        CombinedStatus {
            state,
            total_count: self.total_count,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckSuitesResponse {
    #[serde(default)]
    pub check_suites: Vec<CheckSuiteResponse>,
}

#[derive(Debug, Deserialize)]
pub struct CheckSuiteResponse {
    pub status: Option<String>,
    pub conclusion: Option<String>,
}

impl CheckSuiteResponse {
    pub fn into_suite(self) -> CheckSuite {
        let status = match self.status.as_deref() {
            Some("queued") => CheckStatus::Queued,
            Some("in_progress") => CheckStatus::InProgress,
            Some("completed") => CheckStatus::Completed,
            _ => CheckStatus::Unknown,
        };
        let conclusion = self.conclusion.as_deref().map(|c| match c {
            "success" => CheckConclusion::Success,
            "neutral" => CheckConclusion::Neutral,
            "skipped" => CheckConclusion::Skipped,
            "failure" => CheckConclusion::Failure,
            "timed_out" => CheckConclusion::TimedOut,
            "cancelled" => CheckConclusion::Cancelled,
            "action_required" => CheckConclusion::ActionRequired,
            "stale" => CheckConclusion::Stale,
            "startup_failure" => CheckConclusion::StartupFailure,
            _ => CheckConclusion::Unknown,
        });
        CheckSuite { status, conclusion }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompareResponse {
    #[serde(default)]
    pub behind_by: u32,
}

#[derive(Debug, Deserialize)]
pub struct ContentsResponse {
    pub encoding: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallationTokenResponse {
    pub token: String,
    pub expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommitPullResponse {
    pub number: u64,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct ErrorMessageResponse {
    #[serde(default)]
    pub message: String,
}
