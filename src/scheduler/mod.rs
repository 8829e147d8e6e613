//! Worker loops that drain per-repo queues.
//!
//! Each worker repeatedly discovers repos with pending work, takes the repo
//! lease, pops one item, runs the merge pipeline against it, and settles the
//! outcome back into the store. The lease keeps at most one pipeline per
//! repo in flight across all processes; the token-gated guard doubles as the
//! pipeline's heartbeat handle.

pub mod backpressure;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::pipeline::{Heartbeat, Pipeline, PipelineOutcome};
use crate::store::{QueueStore, StoreError};
use crate::types::{LeaseToken, RepoKey, WorkItem};

/// Scheduler knobs, extracted from `Settings`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lease_ttl: Duration,
    pub max_retries: u32,
    pub max_item_window: Duration,
    pub idle_sleep: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        SchedulerConfig {
            lease_ttl: settings.lease_ttl,
            max_retries: settings.max_retries,
            max_item_window: settings.max_item_window,
            idle_sleep: settings.idle_sleep,
        }
    }
}

/// A held repo lease. Refreshes act as the pipeline heartbeat; release is
/// token-gated, so a guard whose lease was taken over cannot disturb the new
/// holder.
pub struct LeaseGuard {
    store: Arc<dyn QueueStore>,
    key: RepoKey,
    token: LeaseToken,
    ttl: Duration,
}

impl LeaseGuard {
    pub async fn release(self) {
        if let Err(e) = self.store.release_lease(&self.key, &self.token).await {
            warn!(repo = %self.key, error = %e, "failed to release lease");
        }
    }
}

#[async_trait]
impl Heartbeat for LeaseGuard {
    async fn beat(&self) -> Result<bool, StoreError> {
        self.store
            .refresh_lease(&self.key, &self.token, self.ttl)
            .await
    }
}

/// The worker pool driver.
pub struct Scheduler {
    store: Arc<dyn QueueStore>,
    metrics: Arc<Metrics>,
    pipeline: Pipeline,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        metrics: Arc<Metrics>,
        pipeline: Pipeline,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            store,
            metrics,
            pipeline,
            config,
        }
    }

    /// Spawns `count` worker loops that run until `shutdown` fires.
    pub fn spawn_workers(
        self: Arc<Self>,
        count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let scheduler = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    scheduler.worker_loop(worker_id, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        info!(worker_id, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let processed = self.sweep().await;
            if !processed {
                let jitter_ms = rand::thread_rng()
                    .gen_range(0..=self.config.idle_sleep.as_millis().max(1) as u64 / 2);
                let nap = self.config.idle_sleep + Duration::from_millis(jitter_ms);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(nap) => {}
                }
            }
        }
        info!(worker_id, "worker stopped");
    }

    /// One pass over every repo with pending work. Returns whether any item
    /// was run through the pipeline.
    pub async fn sweep(&self) -> bool {
        let repos = match self.store.repos_with_work().await {
            Ok(repos) => repos,
            Err(e) => {
                warn!(error = %e, "work discovery failed");
                return false;
            }
        };

        let mut processed = false;
        for key in repos {
            self.refresh_queue_gauges(&key).await;

            if self.installation_throttled(&key).await {
                continue;
            }

            let owner_repo = [key.repo.owner.clone(), key.repo.repo.clone()];
            let labels: Vec<&str> = owner_repo.iter().map(String::as_str).collect();

            let token = match self.store.acquire_lease(&key, self.config.lease_ttl).await {
                Ok(Some(token)) => {
                    self.metrics
                        .worker_lock_acquired
                        .with_label_values(&labels)
                        .inc();
                    token
                }
                Ok(None) => {
                    self.metrics
                        .worker_lock_failed
                        .with_label_values(&labels)
                        .inc();
                    continue;
                }
                Err(e) => {
                    warn!(repo = %key, error = %e, "lease acquisition failed");
                    continue;
                }
            };
            let guard = LeaseGuard {
                store: Arc::clone(&self.store),
                key: key.clone(),
                token,
                ttl: self.config.lease_ttl,
            };
            self.metrics.worker_active.with_label_values(&labels).set(1);

            match self.store.pop_head(&key).await {
                Ok(Some(item)) => {
                    if self.should_starve(&item) {
                        self.starve(item).await;
                    } else {
                        let outcome = self.pipeline.run(&item, &guard).await;
                        self.settle(item, outcome).await;
                        processed = true;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(repo = %key, error = %e, "pop failed"),
            }

            self.metrics.worker_active.with_label_values(&labels).set(0);
            guard.release().await;
        }
        processed
    }

    /// Maps a pipeline outcome onto queue mutations. This is the only place
    /// that decides between complete, requeue, and dead-letter.
    async fn settle(&self, item: WorkItem, outcome: PipelineOutcome) {
        let result = match outcome {
            PipelineOutcome::Merged => self.store.complete(&item).await,
            PipelineOutcome::Dropped(reason) => {
                debug!(repo = %item.key(), pr = %item.number, reason = reason.as_str(), "dropped");
                self.store.complete(&item).await
            }
            PipelineOutcome::Retry { reason, at_head } => {
                let next = item.next_attempt();
                if next.attempt >= self.config.max_retries {
                    info!(
                        repo = %next.key(),
                        pr = %next.number,
                        attempts = next.attempt,
                        reason = reason.as_str(),
                        "retry budget exhausted, dead-lettering"
                    );
                    self.metrics
                        .dlq_pushes
                        .with_label_values(&[reason.as_str()])
                        .inc();
                    self.store.push_dlq(next, reason.as_str()).await
                } else {
                    self.metrics
                        .retries
                        .with_label_values(&[reason.as_str()])
                        .inc();
                    if at_head {
                        self.store.requeue_head(next).await
                    } else {
                        self.store.requeue_tail(next).await
                    }
                }
            }
            PipelineOutcome::Throttled { .. } => {
                // The throttle window is already set; the item waits at the
                // head with its attempt count untouched.
                self.store.requeue_head(item).await
            }
            PipelineOutcome::DeadLetter(reason) => {
                self.metrics
                    .dlq_pushes
                    .with_label_values(&[reason.as_str()])
                    .inc();
                self.store.push_dlq(item, reason.as_str()).await
            }
            // No queue mutation: the item sits in the in-flight slot and the
            // next lease holder recovers it.
            PipelineOutcome::LeaseLost => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to settle pipeline outcome");
        }
    }

    fn should_starve(&self, item: &WorkItem) -> bool {
        if item.starved {
            return false;
        }
        let window = chrono::Duration::from_std(self.config.max_item_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        Utc::now() - item.first_seen_at > window
    }

    async fn starve(&self, item: WorkItem) {
        info!(repo = %item.key(), pr = %item.number, "starvation requeue");
        self.metrics
            .starvation_requeue
            .with_label_values(&[&item.repo.owner, &item.repo.repo])
            .inc();
        let requeued = item.starvation_requeued(Utc::now());
        if let Err(e) = self.store.requeue_tail(requeued).await {
            warn!(error = %e, "starvation requeue failed");
        }
    }

    async fn installation_throttled(&self, key: &RepoKey) -> bool {
        let label = key.installation.to_string();
        match self.store.get_throttle(key.installation).await {
            Ok(Some(until)) => {
                self.metrics
                    .backpressure_active
                    .with_label_values(&[&label])
                    .set(1);
                debug!(repo = %key, %until, "skipping throttled installation");
                true
            }
            Ok(None) => {
                self.metrics
                    .backpressure_active
                    .with_label_values(&[&label])
                    .set(0);
                false
            }
            Err(e) => {
                warn!(repo = %key, error = %e, "throttle lookup failed");
                false
            }
        }
    }

    async fn refresh_queue_gauges(&self, key: &RepoKey) {
        let labels = [key.repo.owner.as_str(), key.repo.repo.as_str()];
        if let Ok(depth) = self.store.queue_depth(key).await {
            self.metrics
                .queue_depth
                .with_label_values(&labels)
                .set(depth as i64);
        }
        if let Ok(oldest) = self.store.oldest_enqueued_at(key).await {
            let age = oldest
                .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0)
                .unwrap_or(0.0);
            self.metrics
                .queue_oldest_age_seconds
                .with_label_values(&labels)
                .set(age);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::GitHubApi;
    use crate::pipeline::PipelineConfig;
    use crate::store::MemoryStore;
    use crate::test_utils::{FakeGitHub, pr_snapshot};
    use crate::types::{InstallationId, MergeableState, PrNumber, RepoId, Sha};

    struct Harness {
        scheduler: Scheduler,
        store: Arc<MemoryStore>,
        api: Arc<FakeGitHub>,
        metrics: Arc<Metrics>,
    }

    fn harness(api: FakeGitHub) -> Harness {
        harness_with(api, |_| {})
    }

    fn harness_with(api: FakeGitHub, tweak: impl FnOnce(&mut SchedulerConfig)) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(api);
        let metrics = Arc::new(Metrics::new().unwrap());
        let settings = crate::config::Settings::for_tests();

        let pipeline = Pipeline::new(
            Arc::clone(&api) as Arc<dyn GitHubApi>,
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::clone(&metrics),
            PipelineConfig::from_settings(&settings),
        );
        let mut config = SchedulerConfig::from_settings(&settings);
        tweak(&mut config);
        let scheduler = Scheduler::new(
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::clone(&metrics),
            pipeline,
            config,
        );
        Harness {
            scheduler,
            store,
            api,
            metrics,
        }
    }

    fn item(n: u64) -> WorkItem {
        WorkItem::new(InstallationId(1), RepoId::new("octocat", "widgets"), PrNumber(n))
    }

    fn repo_key() -> RepoKey {
        item(0).key()
    }

    #[tokio::test]
    async fn happy_path_merges_and_completes() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        let h = harness(api);

        h.store.enqueue(item(7)).await.unwrap();
        assert!(h.scheduler.sweep().await);

        let merges = h.api.merged.lock().unwrap().clone();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].number, PrNumber(7));
        assert_eq!(merges[0].title, "Add feature (#7)");
        assert_eq!(merges[0].method.as_str(), "squash");

        assert_eq!(
            h.metrics.merges_success.with_label_values(&["squash"]).get(),
            1
        );
        // The item is gone and the PR can be enqueued again.
        assert!(h.store.repos_with_work().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn behind_head_is_updated_then_merged() {
        let api = FakeGitHub::new();
        let mut behind = pr_snapshot(7);
        behind.behind_by = 3;
        behind.mergeable_state = MergeableState::Behind;
        api.push_pr(behind);
        // After the update the refetched snapshot is clean.
        api.push_pr(pr_snapshot(7));
        let h = harness(api);

        h.store.enqueue(item(7)).await.unwrap();
        assert!(h.scheduler.sweep().await);

        assert_eq!(
            h.metrics.branch_updates.with_label_values(&["ok"]).get(),
            1
        );
        assert_eq!(
            h.metrics.merges_success.with_label_values(&["squash"]).get(),
            1
        );
        assert_eq!(h.api.update_branch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn checks_timeout_requeues_then_dead_letters() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.push_pr(pr_snapshot(7));
        api.set_policy_file("max_wait_minutes: 1\npoll_interval_seconds: 10");
        api.set_checks_pending();
        let h = harness_with(api, |c| c.max_retries = 2);

        h.store.enqueue(item(7)).await.unwrap();

        // First pass: six polls, timeout, requeued with attempt 1.
        assert!(h.scheduler.sweep().await);
        assert_eq!(
            h.metrics.retries.with_label_values(&["checks_timeout"]).get(),
            1
        );
        let requeued = h.store.pop_head(&repo_key()).await.unwrap().unwrap();
        assert_eq!(requeued.attempt, 1);
        assert_eq!(h.api.combined_status_calls(), 6);
        h.store.requeue_head(requeued).await.unwrap();

        // Second pass exhausts the budget and dead-letters.
        assert!(h.scheduler.sweep().await);
        let letters = h.store.list_dlq(&repo_key()).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "checks_timeout");
        assert_eq!(letters[0].item.attempt, 2);
        assert_eq!(
            h.metrics
                .dlq_pushes
                .with_label_values(&["checks_timeout"])
                .get(),
            1
        );
        // The dedup entry is released with the dead-letter push.
        assert!(h.store.repos_with_work().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn moved_head_requeues_at_front_then_merges() {
        let api = FakeGitHub::new();
        let old_head = pr_snapshot(7);
        let mut new_head = pr_snapshot(7);
        new_head.head_sha = Sha::parse("b".repeat(40)).unwrap();
        // Evaluation sees the old head; the pre-merge refetch sees the new
        // one, so the first pass must not merge.
        api.push_pr(old_head);
        api.push_pr(new_head);
        let h = harness(api);

        h.store.enqueue(item(7)).await.unwrap();
        assert!(h.scheduler.sweep().await);

        assert!(h.api.merged.lock().unwrap().is_empty());
        assert_eq!(
            h.metrics
                .retries
                .with_label_values(&["mismatched_sha"])
                .get(),
            1
        );

        // Second pass observes the new head consistently and merges.
        assert!(h.scheduler.sweep().await);
        let merges = h.api.merged.lock().unwrap().clone();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].expected_head.as_str(), "b".repeat(40));
    }

    #[tokio::test]
    async fn throttled_installation_is_skipped() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        let h = harness(api);

        h.store.enqueue(item(7)).await.unwrap();
        h.store
            .set_throttle(
                InstallationId(1),
                Utc::now() + chrono::Duration::seconds(60),
            )
            .await
            .unwrap();

        assert!(!h.scheduler.sweep().await);
        assert_eq!(h.store.queue_depth(&repo_key()).await.unwrap(), 1);
        assert_eq!(
            h.metrics.backpressure_active.with_label_values(&["1"]).get(),
            1
        );
        assert!(h.api.merged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn low_quota_engages_backpressure() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        api.set_rate_limit(10, Some(Utc::now() + chrono::Duration::seconds(30)));
        let h = harness(api);

        h.store.enqueue(item(7)).await.unwrap();
        assert!(h.scheduler.sweep().await);

        // The run itself completed, and the installation now has a window.
        assert!(h.store.get_throttle(InstallationId(1)).await.unwrap().is_some());
        assert!(h.metrics.throttles.with_label_values(&["low_budget"]).get() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn killed_worker_item_is_recovered_after_lease_expiry() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(7));
        let h = harness(api);

        h.store.enqueue(item(7)).await.unwrap();

        // Worker A takes the lease, pops the item, and dies.
        let _dead_token = h
            .store
            .acquire_lease(&repo_key(), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        h.store.pop_head(&repo_key()).await.unwrap().unwrap();

        // While the lease is live no one else can process.
        assert!(!h.scheduler.sweep().await);

        // After the TTL the sweep takes over and recovers the item.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(h.scheduler.sweep().await);
        assert_eq!(h.api.merged.lock().unwrap().len(), 1);
        assert!(h.store.repos_with_work().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_head_item_is_starved_once() {
        let api = FakeGitHub::new();
        api.push_pr(pr_snapshot(8));
        let h = harness(api);

        let mut stale = item(7);
        stale.first_seen_at = Utc::now() - chrono::Duration::seconds(3600);
        h.store.enqueue(stale).await.unwrap();
        h.store.enqueue(item(8)).await.unwrap();

        // The stale head moves to the tail; nothing runs this pass.
        assert!(!h.scheduler.sweep().await);
        assert_eq!(
            h.metrics
                .starvation_requeue
                .with_label_values(&["octocat", "widgets"])
                .get(),
            1
        );

        // Next pass runs the sibling that was being starved.
        assert!(h.scheduler.sweep().await);
        let merges = h.api.merged.lock().unwrap().clone();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].number, PrNumber(8));

        // The requeued item is marked: it will not starve again.
        let tail = h.store.pop_head(&repo_key()).await.unwrap().unwrap();
        assert!(tail.starved);
        assert!(!h.scheduler.should_starve(&tail));
    }
}
