//! Typed facade over the GitHub REST API.
//!
//! The pipeline calls typed methods and receives typed outcomes; transport,
//! App token minting, and HTTP retries live behind the `GitHubApi` trait.
//! Idempotent reads and `update_branch` may retry on 5xx/transport failures;
//! `merge_pr` is never retried here - merge failures propagate so the
//! pipeline can decide.
//!
//! Every response's quota headers are observed into a shared snapshot that
//! the pipeline reads for backpressure decisions.

pub mod client;
pub mod error;
pub mod retry;
pub mod types;

use async_trait::async_trait;

use crate::policy::MergeMethod;
use crate::types::{
    CheckSuite, CombinedStatus, InstallationId, PrNumber, PrSnapshot, RepoId, Sha,
};

pub use client::HttpGitHubClient;
pub use error::ApiError;
pub use retry::RetryConfig;
pub use types::{MergeOutcome, RateLimitSnapshot, UpdateBranchOutcome};

/// Typed operations against the code-review platform.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// Fetches a PR snapshot, including how far the head is behind its base.
    async fn get_pr(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        number: PrNumber,
    ) -> Result<PrSnapshot, ApiError>;

    /// Fetches the combined commit status for a head SHA.
    async fn combined_status(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<CombinedStatus, ApiError>;

    /// Lists check suites for a head SHA.
    async fn check_suites(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<Vec<CheckSuite>, ApiError>;

    /// Reads a file from the repository at the given ref. `Ok(None)` when
    /// the file does not exist.
    async fn repo_file(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>, ApiError>;

    /// Asks the platform to merge the base branch into the PR head.
    async fn update_branch(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        number: PrNumber,
    ) -> Result<UpdateBranchOutcome, ApiError>;

    /// Merges a PR, guarded by the expected head SHA. Never retried.
    #[allow(clippy::too_many_arguments)]
    async fn merge_pr(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        number: PrNumber,
        expected_head: &Sha,
        method: MergeMethod,
        title: &str,
        body: &str,
    ) -> Result<MergeOutcome, ApiError>;

    /// Open PRs whose head is the given commit.
    async fn prs_for_commit(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<Vec<PrNumber>, ApiError>;

    /// The quota snapshot observed on the most recent API response.
    fn rate_limit(&self) -> Option<RateLimitSnapshot>;

    /// App-level liveness probe used by the readiness endpoint.
    async fn ping(&self) -> Result<(), ApiError>;
}
