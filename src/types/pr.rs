//! Pull request snapshot types.
//!
//! A `PrSnapshot` is the facade's typed view of a PR at a point in time. The
//! pipeline never sees raw payloads; eligibility decisions are made against
//! these fields.

use serde::{Deserialize, Serialize};

use super::ids::{PrNumber, Sha};

/// The open/closed state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
}

impl PrState {
    pub fn is_open(&self) -> bool {
        matches!(self, PrState::Open)
    }
}

/// GitHub's composite judgment about whether a merge would succeed.
///
/// Mirrors the REST `mergeable_state` field. Values the platform may add
/// later fold into `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeableState {
    /// All requirements satisfied.
    Clean,

    /// Non-required checks failing; the merge button would still work.
    Unstable,

    /// Required reviews or protection rules unsatisfied. Needs a human;
    /// a later event re-triggers evaluation.
    Blocked,

    /// Head branch behind base.
    Behind,

    /// Merge conflicts exist. Never retried on the same head.
    Dirty,

    /// PR is a draft.
    Draft,

    /// Repository has merge hooks or a merge queue enabled.
    HasHooks,

    /// Not yet computed by the platform.
    #[serde(other)]
    Unknown,
}

impl MergeableState {
    /// Parses the REST API string form, folding unrecognized values into
    /// `Unknown`.
    pub fn from_api(s: &str) -> Self {
        match s {
            "clean" => MergeableState::Clean,
            "unstable" => MergeableState::Unstable,
            "blocked" => MergeableState::Blocked,
            "behind" => MergeableState::Behind,
            "dirty" => MergeableState::Dirty,
            "draft" => MergeableState::Draft,
            "has_hooks" => MergeableState::HasHooks,
            _ => MergeableState::Unknown,
        }
    }

    /// True when the PR has a merge conflict.
    pub fn is_conflicted(&self) -> bool {
        matches!(self, MergeableState::Dirty)
    }

    /// True when branch protection or required reviews block the merge.
    pub fn is_blocked(&self) -> bool {
        matches!(self, MergeableState::Blocked)
    }
}

/// A typed snapshot of a pull request, as returned by the API facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrSnapshot {
    pub number: PrNumber,
    pub state: PrState,
    pub draft: bool,
    pub locked: bool,
    pub labels: Vec<String>,
    pub head_sha: Sha,
    pub head_ref: String,
    pub base_ref: String,
    /// `None` while the platform is still computing mergeability.
    pub mergeable: Option<bool>,
    pub mergeable_state: MergeableState,
    /// Login of the PR author, when known.
    pub user: Option<String>,
    pub title: String,
    pub body: Option<String>,
    /// Commits the head is behind its base. Zero when up to date or unknown.
    pub behind_by: u32,
}

impl PrSnapshot {
    /// True when the PR carries a label with the given name.
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l == name)
    }
}
