//! Ingress normalizer: maps validated webhook events into work items.
//!
//! An event yields zero or more enqueued items. `pull_request` events map
//! directly; `check_suite` and `status` events are resolved to the open PRs
//! for the reported head SHA through the API facade, off the request path so
//! the webhook can be acknowledged immediately. Everything else is counted
//! and dropped.
//!
//! The label gate here uses the process-wide default label; the
//! authoritative policy label is re-checked under lease by the pipeline.

pub mod event;
pub mod signature;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::github::GitHubApi;
use crate::metrics::Metrics;
use crate::store::{EnqueueOutcome, QueueStore};
use crate::types::{InstallationId, PrNumber, RepoId, Sha, WorkItem};

use event::{CheckSuiteEvent, PullRequestEvent, StatusEvent};

pub use signature::{compute_signature, format_signature_header, verify_signature};

/// `pull_request` actions that can change merge eligibility.
const HANDLED_PR_ACTIONS: &[&str] = &[
    "opened",
    "reopened",
    "synchronize",
    "labeled",
    "unlabeled",
    "ready_for_review",
];

/// What the normalizer did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// One item was enqueued.
    Enqueued,

    /// The PR is already queued or in flight.
    Deduped,

    /// PR resolution for the event continues in the background.
    Resolving,

    /// The event cannot produce work.
    Ignored(&'static str),
}

/// The event normalizer. Shared by the webhook handler; clones are cheap
/// handles onto the same store and facade.
#[derive(Clone)]
pub struct Ingress {
    store: Arc<dyn QueueStore>,
    api: Arc<dyn GitHubApi>,
    metrics: Arc<Metrics>,
    default_label: String,
}

impl Ingress {
    pub fn new(
        store: Arc<dyn QueueStore>,
        api: Arc<dyn GitHubApi>,
        metrics: Arc<Metrics>,
        default_label: String,
    ) -> Self {
        Ingress {
            store,
            api,
            metrics,
            default_label,
        }
    }

    /// Normalizes one validated event. Returns quickly; SHA-to-PR resolution
    /// runs in a spawned task.
    pub async fn handle_event(&self, event: &str, payload: Value) -> IngressOutcome {
        match event {
            "pull_request" => self.handle_pull_request(payload).await,
            "check_suite" => self.handle_check_suite(payload),
            "status" => self.handle_status(payload),
            _ => IngressOutcome::Ignored("unhandled_event"),
        }
    }

    async fn handle_pull_request(&self, payload: Value) -> IngressOutcome {
        let event: PullRequestEvent = match serde_json::from_value(payload) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "malformed pull_request payload");
                return IngressOutcome::Ignored("malformed_payload");
            }
        };
        let Some(installation) = event.installation.as_ref() else {
            return IngressOutcome::Ignored("no_installation");
        };
        if !HANDLED_PR_ACTIONS.contains(&event.action.as_str()) {
            return IngressOutcome::Ignored("unhandled_action");
        }

        let pr = &event.pull_request;
        if pr.state != "open" {
            return IngressOutcome::Ignored("pr_closed");
        }
        if pr.draft {
            return IngressOutcome::Ignored("pr_draft");
        }
        if !pr.has_label(&self.default_label) {
            return IngressOutcome::Ignored("missing_label");
        }

        self.enqueue(installation.id(), event.repository.repo_id(), pr.pr_number())
            .await
    }

    fn handle_check_suite(&self, payload: Value) -> IngressOutcome {
        let event: CheckSuiteEvent = match serde_json::from_value(payload) {
            Ok(e) => e,
            Err(_) => return IngressOutcome::Ignored("malformed_payload"),
        };
        if event.action != "completed" {
            return IngressOutcome::Ignored("unhandled_action");
        }
        let Some(installation) = event.installation.as_ref().map(|i| i.id()) else {
            return IngressOutcome::Ignored("no_installation");
        };
        let repo = event.repository.repo_id();
        self.spawn_resolution(installation, repo, event.check_suite.head_sha)
    }

    fn handle_status(&self, payload: Value) -> IngressOutcome {
        let event: StatusEvent = match serde_json::from_value(payload) {
            Ok(e) => e,
            Err(_) => return IngressOutcome::Ignored("malformed_payload"),
        };
        let Some(installation) = event.installation.as_ref().map(|i| i.id()) else {
            return IngressOutcome::Ignored("no_installation");
        };
        let repo = event.repository.repo_id();
        self.spawn_resolution(installation, repo, event.sha)
    }

    /// Resolves the PRs behind a head SHA off the request path and enqueues
    /// each open one.
    fn spawn_resolution(
        &self,
        installation: InstallationId,
        repo: RepoId,
        head_sha: String,
    ) -> IngressOutcome {
        let Ok(sha) = Sha::parse(head_sha) else {
            return IngressOutcome::Ignored("malformed_payload");
        };
        let ingress = self.clone();
        tokio::spawn(async move {
            ingress.resolve_and_enqueue(installation, repo, sha).await;
        });
        IngressOutcome::Resolving
    }

    pub(crate) async fn resolve_and_enqueue(
        &self,
        installation: InstallationId,
        repo: RepoId,
        sha: Sha,
    ) {
        match self.api.prs_for_commit(installation, &repo, &sha).await {
            Ok(numbers) => {
                debug!(%repo, sha = sha.short(), count = numbers.len(), "resolved PRs for commit");
                for number in numbers {
                    self.enqueue(installation, repo.clone(), number).await;
                }
            }
            Err(e) => {
                // Nothing is lost permanently: the next PR event re-triggers.
                warn!(%repo, sha = sha.short(), error = %e, "failed to resolve PRs for commit");
            }
        }
    }

    async fn enqueue(
        &self,
        installation: InstallationId,
        repo: RepoId,
        number: PrNumber,
    ) -> IngressOutcome {
        let item = WorkItem::new(installation, repo.clone(), number);
        match self.store.enqueue(item).await {
            Ok(EnqueueOutcome::Enqueued { depth }) => {
                self.metrics
                    .events_enqueued
                    .with_label_values(&[&repo.owner, &repo.repo])
                    .inc();
                self.metrics
                    .queue_depth
                    .with_label_values(&[&repo.owner, &repo.repo])
                    .set(depth as i64);
                debug!(%repo, %number, depth, "enqueued merge candidate");
                IngressOutcome::Enqueued
            }
            Ok(EnqueueOutcome::Deduped) => {
                self.metrics
                    .events_deduped
                    .with_label_values(&[&repo.owner, &repo.repo])
                    .inc();
                debug!(%repo, %number, "deduped event for queued PR");
                IngressOutcome::Deduped
            }
            Err(e) => {
                // The webhook is still acknowledged; the platform redelivers
                // and later events re-trigger.
                warn!(%repo, %number, error = %e, "enqueue failed");
                IngressOutcome::Ignored("store_unavailable")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::FakeGitHub;
    use crate::types::RepoKey;
    use serde_json::json;

    fn ingress_with(api: FakeGitHub) -> (Arc<Ingress>, Arc<MemoryStore>, Arc<Metrics>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let ingress = Arc::new(Ingress::new(
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::new(api),
            Arc::clone(&metrics),
            "automerge".to_string(),
        ));
        (ingress, store, metrics)
    }

    fn pr_payload(number: u64, action: &str) -> Value {
        json!({
            "action": action,
            "pull_request": {
                "number": number,
                "draft": false,
                "state": "open",
                "labels": [{"name": "automerge"}]
            },
            "repository": {"name": "widgets", "owner": {"login": "octocat"}},
            "installation": {"id": 42}
        })
    }

    fn repo_key() -> RepoKey {
        RepoKey::new(InstallationId(42), RepoId::new("octocat", "widgets"))
    }

    #[tokio::test]
    async fn labeled_open_pr_is_enqueued() {
        let (ingress, store, metrics) = ingress_with(FakeGitHub::new());
        let outcome = ingress
            .handle_event("pull_request", pr_payload(7, "synchronize"))
            .await;
        assert_eq!(outcome, IngressOutcome::Enqueued);
        assert_eq!(store.queue_depth(&repo_key()).await.unwrap(), 1);
        assert_eq!(
            metrics
                .events_enqueued
                .with_label_values(&["octocat", "widgets"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_events_are_deduped() {
        let (ingress, store, metrics) = ingress_with(FakeGitHub::new());
        for _ in 0..3 {
            ingress
                .handle_event("pull_request", pr_payload(42, "synchronize"))
                .await;
        }
        assert_eq!(store.queue_depth(&repo_key()).await.unwrap(), 1);
        assert_eq!(
            metrics
                .events_enqueued
                .with_label_values(&["octocat", "widgets"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .events_deduped
                .with_label_values(&["octocat", "widgets"])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn draft_and_closed_and_unlabeled_are_ignored() {
        let (ingress, store, _) = ingress_with(FakeGitHub::new());

        let mut draft = pr_payload(1, "opened");
        draft["pull_request"]["draft"] = json!(true);
        assert_eq!(
            ingress.handle_event("pull_request", draft).await,
            IngressOutcome::Ignored("pr_draft")
        );

        let mut closed = pr_payload(2, "opened");
        closed["pull_request"]["state"] = json!("closed");
        assert_eq!(
            ingress.handle_event("pull_request", closed).await,
            IngressOutcome::Ignored("pr_closed")
        );

        let mut unlabeled = pr_payload(3, "opened");
        unlabeled["pull_request"]["labels"] = json!([{"name": "bug"}]);
        assert_eq!(
            ingress.handle_event("pull_request", unlabeled).await,
            IngressOutcome::Ignored("missing_label")
        );

        assert_eq!(store.queue_depth(&repo_key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn irrelevant_actions_and_events_are_ignored() {
        let (ingress, _, _) = ingress_with(FakeGitHub::new());
        assert_eq!(
            ingress
                .handle_event("pull_request", pr_payload(1, "assigned"))
                .await,
            IngressOutcome::Ignored("unhandled_action")
        );
        assert_eq!(
            ingress.handle_event("push", json!({})).await,
            IngressOutcome::Ignored("unhandled_event")
        );
    }

    #[tokio::test]
    async fn check_suite_resolves_open_prs() {
        let api = FakeGitHub::new();
        api.set_prs_for_commit(vec![PrNumber(5), PrNumber(6)]);
        let (ingress, store, _) = ingress_with(api);

        let payload = json!({
            "action": "completed",
            "check_suite": {"head_sha": "c".repeat(40)},
            "repository": {"name": "widgets", "owner": {"login": "octocat"}},
            "installation": {"id": 42}
        });
        let outcome = ingress.handle_event("check_suite", payload).await;
        assert_eq!(outcome, IngressOutcome::Resolving);

        // Resolution runs in a spawned task; nudge the scheduler.
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if store.queue_depth(&repo_key()).await.unwrap() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.queue_depth(&repo_key()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn status_event_with_no_prs_enqueues_nothing() {
        let api = FakeGitHub::new();
        api.set_prs_for_commit(vec![]);
        let (ingress, store, _) = ingress_with(api);

        let payload = json!({
            "sha": "d".repeat(40),
            "repository": {"name": "widgets", "owner": {"login": "octocat"}},
            "installation": {"id": 42}
        });
        assert_eq!(
            ingress.handle_event("status", payload).await,
            IngressOutcome::Resolving
        );
        tokio::task::yield_now().await;
        assert_eq!(store.queue_depth(&repo_key()).await.unwrap(), 0);
    }
}
