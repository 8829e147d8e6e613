//! The unit of scheduling: one queued merge attempt for a specific PR.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DedupKey, InstallationId, PrNumber, RepoId, RepoKey};

/// A scheduled attempt to merge a specific pull request.
///
/// Items are created by the ingress normalizer, mutated by exactly one
/// worker at a time (the lease holder), and destroyed by a successful merge,
/// a terminal failure (dead-lettered), or an explicit drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Installation the repository belongs to.
    pub installation: InstallationId,

    /// Repository coordinates.
    pub repo: RepoId,

    /// The pull request this item targets.
    pub number: PrNumber,

    /// When the item was first enqueued. Preserved across retries and
    /// starvation requeues; drives the `queue_oldest_age_seconds` gauge.
    pub enqueued_at: DateTime<Utc>,

    /// Retry counter, 0 on the first try.
    pub attempt: u32,

    /// Start of the starvation window. Reset when the item is requeued to
    /// the tail for starvation control.
    pub first_seen_at: DateTime<Utc>,

    /// Whether the item has already been requeued once for starvation.
    /// The starvation requeue happens at most once per item.
    pub starved: bool,
}

impl WorkItem {
    pub fn new(installation: InstallationId, repo: RepoId, number: PrNumber) -> Self {
        let now = Utc::now();
        WorkItem {
            installation,
            repo,
            number,
            enqueued_at: now,
            attempt: 0,
            first_seen_at: now,
            starved: false,
        }
    }

    /// The queue coordinate this item belongs to.
    pub fn key(&self) -> RepoKey {
        RepoKey::new(self.installation, self.repo.clone())
    }

    /// The canonical dedup key for this item.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.key(), self.number)
    }

    /// Returns a copy with the attempt counter incremented, for requeueing
    /// after a transient failure.
    pub fn next_attempt(&self) -> Self {
        WorkItem {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Returns a copy prepared for a starvation requeue: `enqueued_at` is
    /// preserved, the starvation window restarts, and the item is marked so
    /// it will not be requeued for this reason again.
    pub fn starvation_requeued(&self, now: DateTime<Utc>) -> Self {
        WorkItem {
            first_seen_at: now,
            starved: true,
            ..self.clone()
        }
    }
}
