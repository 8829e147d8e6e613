//! The per-item merge state machine.
//!
//! One run drives a single work item through: policy load, eligibility
//! evaluation, branch update (when behind), check waiting, and the merge
//! itself. The run happens under the repo lease; during long waits the
//! lease is refreshed through the `Heartbeat` handle, and a lost lease
//! aborts the run immediately without touching queue state.
//!
//! The pipeline only *returns* an outcome; the scheduler is the sole place
//! that maps outcomes onto queue mutations (complete, requeue, dead-letter).

pub mod checks;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::github::{ApiError, GitHubApi, MergeOutcome, UpdateBranchOutcome};
use crate::metrics::Metrics;
use crate::policy::{self, PolicyError, RepoPolicy};
use crate::scheduler::backpressure;
use crate::store::{QueueStore, StoreError};
use crate::types::{PrSnapshot, WorkItem};

use checks::{ChecksVerdict, classify};

/// Lease refresh handle passed into a pipeline run by the lease holder.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    /// Extends the repo lease. `Ok(false)` means the lease was lost.
    async fn beat(&self) -> Result<bool, StoreError>;
}

/// Why an item was dropped (completed without a merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    PrMissing,
    Closed,
    Draft,
    Locked,
    MissingLabel,
    MergeConflict,
    BlockedByPolicy,
    BehindUpdatesDisabled,
    ChecksFailed,
    NotMergeable,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::PrMissing => "pr_missing",
            DropReason::Closed => "closed",
            DropReason::Draft => "draft",
            DropReason::Locked => "locked",
            DropReason::MissingLabel => "missing_label",
            DropReason::MergeConflict => "merge_conflict",
            DropReason::BlockedByPolicy => "blocked_by_policy",
            DropReason::BehindUpdatesDisabled => "behind_updates_disabled",
            DropReason::ChecksFailed => "checks_failed",
            DropReason::NotMergeable => "not_mergeable",
        }
    }
}

/// Why an item is being requeued for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Transport,
    ChecksTimeout,
    MismatchedSha,
    Forbidden,
    Internal,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::Transport => "transport",
            RetryReason::ChecksTimeout => "checks_timeout",
            RetryReason::MismatchedSha => "mismatched_sha",
            RetryReason::Forbidden => "forbidden",
            RetryReason::Internal => "internal",
        }
    }
}

/// Terminal failures that dead-letter the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqReason {
    ConfigInvalid,
    BranchUpdateFailed,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::ConfigInvalid => "config_invalid",
            DlqReason::BranchUpdateFailed => "branch_update_failed",
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The PR was merged.
    Merged,

    /// The item is finished without a merge; its dedup entry is released.
    Dropped(DropReason),

    /// Transient failure: requeue with `attempt + 1`, dead-letter once the
    /// budget is exhausted. `at_head` puts the item back at the front so it
    /// is re-examined next.
    Retry { reason: RetryReason, at_head: bool },

    /// The installation hit a rate limit. The item returns to the head with
    /// `attempt` unchanged and waits out the throttle window.
    Throttled { until: Option<DateTime<Utc>> },

    /// Terminal failure for manual triage.
    DeadLetter(DlqReason),

    /// The lease was lost mid-run; no queue state was touched.
    LeaseLost,
}

/// Knobs the pipeline needs beyond the per-repo policy.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub heartbeat: Duration,
    pub rate_limit_min_remaining: u32,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_jitter: Duration,
    pub max_backoff: Duration,
}

impl PipelineConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        PipelineConfig {
            heartbeat: settings.heartbeat,
            rate_limit_min_remaining: settings.rate_limit_min_remaining,
            rate_limit_cooldown: settings.rate_limit_cooldown,
            rate_limit_jitter: settings.rate_limit_jitter,
            max_backoff: settings.max_backoff,
        }
    }
}

/// The merge state machine.
pub struct Pipeline {
    api: Arc<dyn GitHubApi>,
    store: Arc<dyn QueueStore>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        api: Arc<dyn GitHubApi>,
        store: Arc<dyn QueueStore>,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        Pipeline {
            api,
            store,
            metrics,
            config,
        }
    }

    /// Runs the state machine for one item.
    pub async fn run(&self, item: &WorkItem, heartbeat: &dyn Heartbeat) -> PipelineOutcome {
        let key = item.key();
        debug!(repo = %key, pr = %item.number, attempt = item.attempt, "pipeline start");

        // The snapshot is fetched first so the policy can be read from the
        // PR's base ref.
        let phase = Instant::now();
        let pr = match self
            .api
            .get_pr(item.installation, &item.repo, item.number)
            .await
        {
            Ok(pr) => pr,
            Err(e) => return self.error_outcome(item, e).await,
        };

        let git_policy = match self.load_policy(item, &pr).await {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        self.observe_phase("load_policy", phase);

        let phase = Instant::now();
        if let Some(reason) = evaluate(&pr, &git_policy) {
            self.observe_phase("evaluate", phase);
            if reason == DropReason::BlockedByPolicy {
                self.metrics.merge_blocked.inc();
            }
            info!(repo = %key, pr = %item.number, reason = reason.as_str(), "ineligible, dropping");
            return PipelineOutcome::Dropped(reason);
        }
        self.observe_phase("evaluate", phase);
        self.observe_backpressure(item).await;

        if git_policy.require_up_to_date && pr.behind_by > 0 {
            match self.update_branch_phase(item, &git_policy).await {
                Ok(()) => {}
                Err(outcome) => return outcome,
            }
        }

        match self.wait_for_checks(item, &pr, &git_policy, heartbeat).await {
            Ok(()) => {}
            Err(outcome) => return outcome,
        }

        self.merge_phase(item, &pr, &git_policy).await
    }

    async fn load_policy(
        &self,
        item: &WorkItem,
        pr: &PrSnapshot,
    ) -> Result<RepoPolicy, PipelineOutcome> {
        let contents = match self
            .api
            .repo_file(item.installation, &item.repo, policy::POLICY_PATH, &pr.base_ref)
            .await
        {
            Ok(c) => c,
            Err(e) => return Err(self.error_outcome(item, e).await),
        };
        match contents {
            None => Ok(RepoPolicy::default()),
            Some(text) => policy::parse_policy(&text).map_err(|e: PolicyError| {
                warn!(repo = %item.key(), error = %e, "invalid policy file");
                PipelineOutcome::DeadLetter(DlqReason::ConfigInvalid)
            }),
        }
    }

    async fn update_branch_phase(
        &self,
        item: &WorkItem,
        git_policy: &RepoPolicy,
    ) -> Result<(), PipelineOutcome> {
        let phase = Instant::now();
        let result = self
            .api
            .update_branch(item.installation, &item.repo, item.number)
            .await;
        self.observe_phase("update_branch", phase);

        match result {
            Ok(outcome) => {
                self.metrics
                    .branch_updates
                    .with_label_values(&[outcome.as_str()])
                    .inc();
                match outcome {
                    UpdateBranchOutcome::Ok => {
                        // The platform synthesizes a new head commit; give it
                        // one poll interval before asking about checks.
                        debug!(repo = %item.key(), pr = %item.number, "branch update requested");
                        tokio::time::sleep(git_policy.poll_interval()).await;
                        Ok(())
                    }
                    UpdateBranchOutcome::NotBehind => Ok(()),
                    UpdateBranchOutcome::Conflict => {
                        warn!(repo = %item.key(), pr = %item.number, "branch update conflict");
                        Err(PipelineOutcome::DeadLetter(DlqReason::BranchUpdateFailed))
                    }
                }
            }
            Err(e) => Err(self.error_outcome(item, e).await),
        }
    }

    /// Polls statuses and check suites until they settle, the configured
    /// wait elapses, or the lease is lost.
    async fn wait_for_checks(
        &self,
        item: &WorkItem,
        pr: &PrSnapshot,
        git_policy: &RepoPolicy,
        heartbeat: &dyn Heartbeat,
    ) -> Result<(), PipelineOutcome> {
        let started = Instant::now();
        let deadline = started + git_policy.max_wait();
        let mut next_heartbeat = started + self.config.heartbeat;
        let mut last_verdict = ChecksVerdict::Pending;

        loop {
            if Instant::now() >= deadline {
                self.observe_wait(started);
                // A head that never reported any checks at all is allowed
                // through once the wait has elapsed; the platform's branch
                // protections still apply at merge time.
                if last_verdict == ChecksVerdict::NoChecks {
                    return Ok(());
                }
                debug!(repo = %item.key(), pr = %item.number, "checks wait timed out");
                return Err(PipelineOutcome::Retry {
                    reason: RetryReason::ChecksTimeout,
                    at_head: false,
                });
            }

            let combined = match self
                .api
                .combined_status(item.installation, &item.repo, &pr.head_sha)
                .await
            {
                Ok(c) => c,
                Err(e) => return Err(self.finish_wait(started, self.error_outcome(item, e).await)),
            };
            let suites = match self
                .api
                .check_suites(item.installation, &item.repo, &pr.head_sha)
                .await
            {
                Ok(s) => s,
                Err(e) => return Err(self.finish_wait(started, self.error_outcome(item, e).await)),
            };

            last_verdict = classify(&combined, &suites);
            match last_verdict {
                ChecksVerdict::Green => {
                    self.observe_wait(started);
                    return Ok(());
                }
                ChecksVerdict::NoChecks if git_policy.allow_merge_when_no_checks => {
                    self.observe_wait(started);
                    return Ok(());
                }
                ChecksVerdict::Failing => {
                    self.observe_wait(started);
                    info!(repo = %item.key(), pr = %item.number, "checks failed");
                    return Err(PipelineOutcome::Dropped(DropReason::ChecksFailed));
                }
                ChecksVerdict::Pending | ChecksVerdict::NoChecks => {}
            }

            self.observe_backpressure(item).await;
            tokio::time::sleep(git_policy.poll_interval()).await;

            if Instant::now() >= next_heartbeat {
                match heartbeat.beat().await {
                    Ok(true) => next_heartbeat = Instant::now() + self.config.heartbeat,
                    Ok(false) | Err(_) => {
                        self.metrics
                            .worker_lock_lost
                            .with_label_values(&[&item.repo.owner, &item.repo.repo])
                            .inc();
                        warn!(repo = %item.key(), pr = %item.number, "lease lost during wait");
                        self.observe_wait(started);
                        return Err(PipelineOutcome::LeaseLost);
                    }
                }
            }
        }
    }

    async fn merge_phase(
        &self,
        item: &WorkItem,
        evaluated: &PrSnapshot,
        git_policy: &RepoPolicy,
    ) -> PipelineOutcome {
        let phase = Instant::now();

        // Re-fetch and re-validate: minutes may have passed while waiting.
        let current = match self
            .api
            .get_pr(item.installation, &item.repo, item.number)
            .await
        {
            Ok(pr) => pr,
            Err(e) => return self.error_outcome(item, e).await,
        };
        if let Some(reason) = evaluate(&current, git_policy) {
            self.observe_phase("merge", phase);
            if reason == DropReason::BlockedByPolicy {
                self.metrics.merge_blocked.inc();
            }
            return PipelineOutcome::Dropped(reason);
        }
        if current.mergeable == Some(false) {
            self.observe_phase("merge", phase);
            return PipelineOutcome::Dropped(DropReason::NotMergeable);
        }
        if current.head_sha != evaluated.head_sha {
            // A new head arrived while we waited; the next attempt re-runs
            // the pipeline against it.
            self.observe_phase("merge", phase);
            debug!(
                repo = %item.key(),
                pr = %item.number,
                old = evaluated.head_sha.short(),
                new = current.head_sha.short(),
                "head moved before merge"
            );
            return PipelineOutcome::Retry {
                reason: RetryReason::MismatchedSha,
                at_head: true,
            };
        }

        let (title, body) = match render_message(git_policy, &current) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(repo = %item.key(), error = %e, "template rendering failed");
                self.observe_phase("merge", phase);
                return PipelineOutcome::DeadLetter(DlqReason::ConfigInvalid);
            }
        };

        let method = git_policy.merge_method;
        let result = self
            .api
            .merge_pr(
                item.installation,
                &item.repo,
                item.number,
                &current.head_sha,
                method,
                &title,
                &body,
            )
            .await;
        self.observe_phase("merge", phase);

        let attempt_result = match &result {
            Ok(MergeOutcome::Merged) => "success",
            Ok(MergeOutcome::MismatchedSha) => "mismatched_sha",
            Ok(MergeOutcome::NotMergeable) => "not_mergeable",
            Ok(MergeOutcome::Forbidden) => "forbidden",
            Err(_) => "error",
        };
        self.metrics
            .merge_attempts
            .with_label_values(&[method.as_str(), attempt_result])
            .inc();

        match result {
            Ok(MergeOutcome::Merged) => {
                self.metrics
                    .merges_success
                    .with_label_values(&[method.as_str()])
                    .inc();
                info!(repo = %item.key(), pr = %item.number, %method, "merged");
                PipelineOutcome::Merged
            }
            Ok(MergeOutcome::MismatchedSha) => PipelineOutcome::Retry {
                reason: RetryReason::MismatchedSha,
                at_head: true,
            },
            Ok(MergeOutcome::NotMergeable) => {
                self.metrics
                    .merges_failed
                    .with_label_values(&["not_mergeable"])
                    .inc();
                PipelineOutcome::Dropped(DropReason::NotMergeable)
            }
            Ok(MergeOutcome::Forbidden) => {
                self.apply_cooldown(item, "forbidden", None).await;
                PipelineOutcome::Retry {
                    reason: RetryReason::Forbidden,
                    at_head: true,
                }
            }
            Err(e) => self.error_outcome(item, e).await,
        }
    }

    /// Maps a facade error onto the item's fate.
    async fn error_outcome(&self, item: &WorkItem, error: ApiError) -> PipelineOutcome {
        match error {
            ApiError::Throttled { until } => {
                self.apply_cooldown(item, "rate_limit", until).await;
                PipelineOutcome::Throttled { until }
            }
            ApiError::Transport(message) => {
                debug!(repo = %item.key(), pr = %item.number, %message, "transport failure");
                PipelineOutcome::Retry {
                    reason: RetryReason::Transport,
                    at_head: false,
                }
            }
            ApiError::NotFound(_) => PipelineOutcome::Dropped(DropReason::PrMissing),
            ApiError::Forbidden(message) | ApiError::Decode(message) => {
                warn!(repo = %item.key(), pr = %item.number, %message, "unexpected API failure");
                PipelineOutcome::Retry {
                    reason: RetryReason::Internal,
                    at_head: false,
                }
            }
        }
    }

    /// Engages the installation throttle when the remaining quota dips under
    /// the configured floor.
    async fn observe_backpressure(&self, item: &WorkItem) {
        let Some(rate) = self.api.rate_limit() else {
            return;
        };
        if rate.remaining > self.config.rate_limit_min_remaining {
            return;
        }
        self.apply_cooldown(item, "low_budget", rate.reset_at).await;
    }

    async fn apply_cooldown(
        &self,
        item: &WorkItem,
        reason: &str,
        hint: Option<DateTime<Utc>>,
    ) {
        let now = Utc::now();
        let until = backpressure::throttle_until(
            hint,
            now,
            self.config.rate_limit_cooldown,
            self.config.rate_limit_jitter,
            self.config.max_backoff,
        );
        if let Err(e) = self.store.set_throttle(item.installation, until).await {
            warn!(installation = %item.installation, error = %e, "failed to persist throttle");
            return;
        }
        self.metrics.throttles.with_label_values(&[reason]).inc();
        self.metrics
            .backpressure_active
            .with_label_values(&[&item.installation.to_string()])
            .set(1);
        info!(installation = %item.installation, %until, reason, "backpressure engaged");
    }

    fn observe_phase(&self, phase: &str, started: Instant) {
        self.metrics
            .worker_processing_seconds
            .with_label_values(&[phase])
            .observe(started.elapsed().as_secs_f64());
    }

    fn observe_wait(&self, started: Instant) {
        self.metrics
            .checks_wait_seconds
            .observe(started.elapsed().as_secs_f64());
        self.observe_phase("wait_checks", started);
    }

    fn finish_wait(&self, started: Instant, outcome: PipelineOutcome) -> PipelineOutcome {
        self.observe_wait(started);
        outcome
    }
}

/// Eligibility rules shared by the evaluate phase and the pre-merge
/// re-validation. Returns the drop reason for an ineligible PR.
fn evaluate(pr: &PrSnapshot, git_policy: &RepoPolicy) -> Option<DropReason> {
    if !pr.state.is_open() {
        return Some(DropReason::Closed);
    }
    if pr.draft {
        return Some(DropReason::Draft);
    }
    if pr.locked {
        return Some(DropReason::Locked);
    }
    if !pr.has_label(&git_policy.label) {
        return Some(DropReason::MissingLabel);
    }
    if pr.mergeable_state.is_conflicted() {
        return Some(DropReason::MergeConflict);
    }
    if pr.mergeable_state.is_blocked() {
        return Some(DropReason::BlockedByPolicy);
    }
    if git_policy.require_up_to_date && pr.behind_by > 0 && !git_policy.update_branch {
        return Some(DropReason::BehindUpdatesDisabled);
    }
    None
}

fn render_message(
    git_policy: &RepoPolicy,
    pr: &PrSnapshot,
) -> Result<(String, String), PolicyError> {
    let title = policy::render_template(&git_policy.title_template, pr)?;
    let body = policy::render_template(&git_policy.body_template, pr)?;
    Ok((title, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::{FakeGitHub, pr_snapshot};
    use crate::types::{InstallationId, PrNumber, PrState, RepoId};

    struct AlwaysAlive;

    #[async_trait]
    impl Heartbeat for AlwaysAlive {
        async fn beat(&self) -> Result<bool, StoreError> {
            Ok(true)
        }
    }

    struct DeadLease;

    #[async_trait]
    impl Heartbeat for DeadLease {
        async fn beat(&self) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    struct Harness {
        pipeline: Pipeline,
        api: Arc<FakeGitHub>,
        store: Arc<MemoryStore>,
        metrics: Arc<Metrics>,
    }

    fn harness(api: FakeGitHub) -> Harness {
        let api = Arc::new(api);
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let settings = crate::config::Settings::for_tests();
        let pipeline = Pipeline::new(
            Arc::clone(&api) as Arc<dyn GitHubApi>,
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::clone(&metrics),
            PipelineConfig::from_settings(&settings),
        );
        Harness {
            pipeline,
            api,
            store,
            metrics,
        }
    }

    fn item(n: u64) -> WorkItem {
        WorkItem::new(InstallationId(1), RepoId::new("octocat", "widgets"), PrNumber(n))
    }

    #[tokio::test]
    async fn green_pr_is_merged() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        let h = harness(api);

        let outcome = h.pipeline.run(&item(7), &AlwaysAlive).await;
        assert_eq!(outcome, PipelineOutcome::Merged);

        let merges = h.api.merged.lock().unwrap().clone();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].title, "Add feature (#7)");
        assert_eq!(merges[0].body, "Details.\n\nAuto-merged for PR #7");
    }

    #[tokio::test]
    async fn custom_templates_are_rendered() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_policy_file("title_template: {head} by {user}\nbody_template: see #{number}");
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Merged
        );
        let merges = h.api.merged.lock().unwrap().clone();
        assert_eq!(merges[0].title, "feature by octocat");
        assert_eq!(merges[0].body, "see #7");
    }

    #[tokio::test]
    async fn draft_and_unlabeled_and_closed_are_dropped() {
        for (mutate, expected) in [
            (
                Box::new(|pr: &mut PrSnapshot| pr.draft = true) as Box<dyn Fn(&mut PrSnapshot)>,
                DropReason::Draft,
            ),
            (
                Box::new(|pr: &mut PrSnapshot| pr.labels.clear()),
                DropReason::MissingLabel,
            ),
            (
                Box::new(|pr: &mut PrSnapshot| pr.state = PrState::Closed),
                DropReason::Closed,
            ),
            (
                Box::new(|pr: &mut PrSnapshot| pr.locked = true),
                DropReason::Locked,
            ),
            (
                Box::new(|pr: &mut PrSnapshot| {
                    pr.mergeable_state = crate::types::MergeableState::Dirty
                }),
                DropReason::MergeConflict,
            ),
        ] {
            let api = FakeGitHub::new();
            let mut pr = pr_snapshot(7);
            mutate(&mut pr);
            api.push_pr(pr);
            let h = harness(api);
            assert_eq!(
                h.pipeline.run(&item(7), &AlwaysAlive).await,
                PipelineOutcome::Dropped(expected)
            );
            assert!(h.api.merged.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn blocked_pr_is_dropped_and_counted() {
        let api = FakeGitHub::new();
        let mut pr = pr_snapshot(7);
        pr.mergeable_state = crate::types::MergeableState::Blocked;
        api.push_pr(pr);
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Dropped(DropReason::BlockedByPolicy)
        );
        assert_eq!(h.metrics.merge_blocked.get(), 1);
    }

    #[tokio::test]
    async fn missing_pr_is_dropped() {
        let h = harness(FakeGitHub::new());
        assert_eq!(
            h.pipeline.run(&item(404), &AlwaysAlive).await,
            PipelineOutcome::Dropped(DropReason::PrMissing)
        );
    }

    #[tokio::test]
    async fn behind_with_updates_disabled_is_dropped() {
        let api = FakeGitHub::new();
        let mut pr = pr_snapshot(7);
        pr.behind_by = 2;
        api.push_pr(pr);
        api.set_policy_file("update_branch: false");
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Dropped(DropReason::BehindUpdatesDisabled)
        );
    }

    #[tokio::test]
    async fn malformed_policy_dead_letters() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_policy_file("merge_method: fast-forward");
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::DeadLetter(DlqReason::ConfigInvalid)
        );
    }

    #[tokio::test]
    async fn unknown_template_placeholder_dead_letters() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_policy_file("title_template: {titel}");
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::DeadLetter(DlqReason::ConfigInvalid)
        );
        assert!(h.api.merged.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_branch_conflict_dead_letters() {
        let api = FakeGitHub::new();
        let mut pr = pr_snapshot(7);
        pr.behind_by = 3;
        api.push_pr(pr);
        api.set_update_result(UpdateBranchOutcome::Conflict);
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::DeadLetter(DlqReason::BranchUpdateFailed)
        );
        assert_eq!(
            h.metrics
                .branch_updates
                .with_label_values(&["conflict"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn failing_checks_drop_the_item() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_checks_failing();
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Dropped(DropReason::ChecksFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_checks_time_out_into_retry() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_policy_file("max_wait_minutes: 1\npoll_interval_seconds: 10");
        api.set_checks_pending();
        let h = harness(api);

        let outcome = h.pipeline.run(&item(7), &AlwaysAlive).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Retry {
                reason: RetryReason::ChecksTimeout,
                at_head: false
            }
        );
        assert_eq!(h.api.combined_status_calls(), 6);
    }

    #[tokio::test]
    async fn no_checks_with_allowance_merges_immediately() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_no_checks();
        api.set_policy_file("allow_merge_when_no_checks: true");
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Merged
        );
        assert_eq!(h.api.combined_status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_checks_without_allowance_waits_then_proceeds() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_no_checks();
        api.set_policy_file("max_wait_minutes: 1\npoll_interval_seconds: 10");
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Merged
        );
        assert_eq!(h.api.combined_status_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_aborts_the_wait() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_checks_pending();
        api.set_policy_file("max_wait_minutes: 10\npoll_interval_seconds: 10");
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &DeadLease).await,
            PipelineOutcome::LeaseLost
        );
        assert_eq!(
            h.metrics
                .worker_lock_lost
                .with_label_values(&["octocat", "widgets"])
                .get(),
            1
        );
        assert!(h.api.merged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatched_sha_outcome_retries_at_head() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.push_merge_result(Ok(crate::github::MergeOutcome::MismatchedSha));
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Retry {
                reason: RetryReason::MismatchedSha,
                at_head: true
            }
        );
    }

    #[tokio::test]
    async fn throttled_merge_sets_installation_cooldown() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.push_merge_result(Err(ApiError::Throttled {
            until: Some(Utc::now() + chrono::Duration::seconds(30)),
        }));
        let h = harness(api);

        let outcome = h.pipeline.run(&item(7), &AlwaysAlive).await;
        assert!(matches!(outcome, PipelineOutcome::Throttled { .. }));
        assert!(
            h.store
                .get_throttle(InstallationId(1))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            h.metrics
                .throttles
                .with_label_values(&["rate_limit"])
                .get()
                >= 1
        );
    }

    #[tokio::test]
    async fn forbidden_merge_backs_off_and_retries_at_head() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.push_merge_result(Ok(crate::github::MergeOutcome::Forbidden));
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Retry {
                reason: RetryReason::Forbidden,
                at_head: true
            }
        );
        assert!(
            h.store
                .get_throttle(InstallationId(1))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn not_mergeable_outcome_drops_with_metric() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.push_merge_result(Ok(crate::github::MergeOutcome::NotMergeable));
        let h = harness(api);

        assert_eq!(
            h.pipeline.run(&item(7), &AlwaysAlive).await,
            PipelineOutcome::Dropped(DropReason::NotMergeable)
        );
        assert_eq!(
            h.metrics
                .merges_failed
                .with_label_values(&["not_mergeable"])
                .get(),
            1
        );
    }

    #[test]
    fn evaluate_accepts_clean_labeled_pr() {
        assert_eq!(evaluate(&pr_snapshot(7), &RepoPolicy::default()), None);
    }
}
