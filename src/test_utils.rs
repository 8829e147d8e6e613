//! Shared test fixtures: a scripted API facade and snapshot builders.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::github::{ApiError, GitHubApi, MergeOutcome, RateLimitSnapshot, UpdateBranchOutcome};
use crate::policy::MergeMethod;
use crate::types::{
    CheckSuite, CombinedState, CombinedStatus, InstallationId, MergeableState, PrNumber,
    PrSnapshot, PrState, RepoId, Sha,
};

/// Builds an open, labeled, clean PR snapshot for tests.
pub fn pr_snapshot(number: u64) -> PrSnapshot {
    PrSnapshot {
        number: PrNumber(number),
        state: PrState::Open,
        draft: false,
        locked: false,
        labels: vec!["automerge".to_string()],
        head_sha: Sha::parse("a".repeat(40)).unwrap(),
        head_ref: "feature".to_string(),
        base_ref: "main".to_string(),
        mergeable: Some(true),
        mergeable_state: MergeableState::Clean,
        user: Some("octocat".to_string()),
        title: "Add feature".to_string(),
        body: Some("Details.".to_string()),
        behind_by: 0,
    }
}

/// A recorded merge call.
#[derive(Debug, Clone)]
pub struct MergeCall {
    pub number: PrNumber,
    pub expected_head: Sha,
    pub method: MergeMethod,
    pub title: String,
    pub body: String,
}

/// A scripted stand-in for the API facade.
///
/// Snapshots are keyed by PR number and consumed front-to-back; the last one
/// repeats, so a single pushed snapshot answers every fetch. Checks default
/// to green, merges to success.
pub struct FakeGitHub {
    snapshots: Mutex<HashMap<PrNumber, VecDeque<PrSnapshot>>>,
    combined: Mutex<CombinedStatus>,
    suites: Mutex<Vec<CheckSuite>>,
    policy_file: Mutex<Option<String>>,
    update_result: Mutex<UpdateBranchOutcome>,
    merge_results: Mutex<VecDeque<Result<MergeOutcome, ApiError>>>,
    pub merged: Mutex<Vec<MergeCall>>,
    rate: Mutex<Option<RateLimitSnapshot>>,
    commit_prs: Mutex<Vec<PrNumber>>,
    combined_calls: AtomicU32,
    update_calls: AtomicU32,
}

impl FakeGitHub {
    pub fn new() -> Self {
        FakeGitHub {
            snapshots: Mutex::new(HashMap::new()),
            combined: Mutex::new(CombinedStatus {
                state: CombinedState::Success,
                total_count: 1,
            }),
            suites: Mutex::new(Vec::new()),
            policy_file: Mutex::new(None),
            update_result: Mutex::new(UpdateBranchOutcome::Ok),
            merge_results: Mutex::new(VecDeque::new()),
            merged: Mutex::new(Vec::new()),
            rate: Mutex::new(None),
            commit_prs: Mutex::new(Vec::new()),
            combined_calls: AtomicU32::new(0),
            update_calls: AtomicU32::new(0),
        }
    }

    /// Queues a snapshot response for its PR number.
    pub fn push_pr(&self, snapshot: PrSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .entry(snapshot.number)
            .or_default()
            .push_back(snapshot);
    }

    pub fn set_policy_file(&self, text: &str) {
        *self.policy_file.lock().unwrap() = Some(text.to_string());
    }

    pub fn set_checks(&self, combined: CombinedStatus, suites: Vec<CheckSuite>) {
        *self.combined.lock().unwrap() = combined;
        *self.suites.lock().unwrap() = suites;
    }

    pub fn set_checks_pending(&self) {
        self.set_checks(
            CombinedStatus {
                state: CombinedState::Pending,
                total_count: 1,
            },
            Vec::new(),
        );
    }

    pub fn set_checks_failing(&self) {
        self.set_checks(
            CombinedStatus {
                state: CombinedState::Failure,
                total_count: 1,
            },
            Vec::new(),
        );
    }

    pub fn set_no_checks(&self) {
        self.set_checks(CombinedStatus::none(), Vec::new());
    }

    pub fn set_update_result(&self, result: UpdateBranchOutcome) {
        *self.update_result.lock().unwrap() = result;
    }

    pub fn push_merge_result(&self, result: Result<MergeOutcome, ApiError>) {
        self.merge_results.lock().unwrap().push_back(result);
    }

    pub fn set_rate_limit(
        &self,
        remaining: u32,
        reset_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        *self.rate.lock().unwrap() = Some(RateLimitSnapshot {
            remaining,
            reset_at,
        });
    }

    pub fn set_prs_for_commit(&self, numbers: Vec<PrNumber>) {
        *self.commit_prs.lock().unwrap() = numbers;
    }

    pub fn combined_status_calls(&self) -> u32 {
        self.combined_calls.load(Ordering::SeqCst)
    }

    pub fn update_branch_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeGitHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitHubApi for FakeGitHub {
    async fn get_pr(
        &self,
        _installation: InstallationId,
        _repo: &RepoId,
        number: PrNumber,
    ) -> Result<PrSnapshot, ApiError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let Some(queue) = snapshots.get_mut(&number) else {
            return Err(ApiError::NotFound(format!("PR {number}")));
        };
        match queue.len() {
            0 => Err(ApiError::NotFound(format!("PR {number}"))),
            1 => Ok(queue.front().unwrap().clone()),
            _ => Ok(queue.pop_front().unwrap()),
        }
    }

    async fn combined_status(
        &self,
        _installation: InstallationId,
        _repo: &RepoId,
        _sha: &Sha,
    ) -> Result<CombinedStatus, ApiError> {
        self.combined_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.combined.lock().unwrap())
    }

    async fn check_suites(
        &self,
        _installation: InstallationId,
        _repo: &RepoId,
        _sha: &Sha,
    ) -> Result<Vec<CheckSuite>, ApiError> {
        Ok(self.suites.lock().unwrap().clone())
    }

    async fn repo_file(
        &self,
        _installation: InstallationId,
        _repo: &RepoId,
        _path: &str,
        _git_ref: &str,
    ) -> Result<Option<String>, ApiError> {
        Ok(self.policy_file.lock().unwrap().clone())
    }

    async fn update_branch(
        &self,
        _installation: InstallationId,
        _repo: &RepoId,
        _number: PrNumber,
    ) -> Result<UpdateBranchOutcome, ApiError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.update_result.lock().unwrap())
    }

    async fn merge_pr(
        &self,
        _installation: InstallationId,
        _repo: &RepoId,
        number: PrNumber,
        expected_head: &Sha,
        method: MergeMethod,
        title: &str,
        body: &str,
    ) -> Result<MergeOutcome, ApiError> {
        let scripted = self.merge_results.lock().unwrap().pop_front();
        let result = scripted.unwrap_or(Ok(MergeOutcome::Merged));
        if matches!(result, Ok(MergeOutcome::Merged)) {
            self.merged.lock().unwrap().push(MergeCall {
                number,
                expected_head: expected_head.clone(),
                method,
                title: title.to_string(),
                body: body.to_string(),
            });
        }
        result
    }

    async fn prs_for_commit(
        &self,
        _installation: InstallationId,
        _repo: &RepoId,
        _sha: &Sha,
    ) -> Result<Vec<PrNumber>, ApiError> {
        Ok(self.commit_prs.lock().unwrap().clone())
    }

    fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        *self.rate.lock().unwrap()
    }

    async fn ping(&self) -> Result<(), ApiError> {
        Ok(())
    }
}
