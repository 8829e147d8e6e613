//! Durable queue store: per-repo FIFO list, dedup set, lease, throttle, and
//! dead-letter list.
//!
//! The core is written against the `QueueStore` trait; any key-value store
//! with atomic list operations and TTL keys can implement it. The crate
//! ships an in-memory realization (`MemoryStore`) used by the single-process
//! deployment and by tests.
//!
//! # Invariants
//!
//! 1. A dedup key is in the set iff the item is in the FIFO list or currently
//!    in flight under the lease.
//! 2. The lease is owned by at most one worker at a time; refresh and release
//!    are gated on the token minted at acquisition.
//! 3. `pop_head` moves the head into a durable in-flight slot without
//!    clearing its dedup entry. If the holder crashes, the next lease holder
//!    recovers the orphaned item from the slot, and events for the same PR
//!    that arrived in the meantime were deduped instead of duplicating work.
//! 4. Dead-lettering an item removes its dedup entry.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::types::{InstallationId, LeaseToken, RepoKey, WorkItem};

pub use memory::MemoryStore;

/// Errors surfaced by the store. Store-unreachable conditions are retryable;
/// the webhook is typically acknowledged regardless.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The item was appended; `depth` is the resulting list length.
    Enqueued { depth: usize },

    /// An item with the same dedup key is already queued or in flight.
    Deduped,
}

/// A dead-lettered item awaiting manual triage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeadLetter {
    pub item: WorkItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// The durable queue store. All operations are atomic with respect to each
/// other.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends an item unless its dedup key is already present.
    async fn enqueue(&self, item: WorkItem) -> Result<EnqueueOutcome, StoreError>;

    /// Takes the next item for processing. Returns the orphaned in-flight
    /// item first (crash recovery), otherwise moves the list head into the
    /// in-flight slot. The dedup entry stays put. Callers must hold the
    /// repo lease.
    async fn pop_head(&self, key: &RepoKey) -> Result<Option<WorkItem>, StoreError>;

    /// Finishes an item: clears the in-flight slot and the dedup entry.
    /// Called on success or explicit drop.
    async fn complete(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Returns an item to the tail of the list. The dedup entry is
    /// unchanged. Used for retries and starvation control.
    async fn requeue_tail(&self, item: WorkItem) -> Result<(), StoreError>;

    /// Returns an item to the head of the list. The dedup entry is
    /// unchanged. Used when the item must be re-examined next (throttling,
    /// head SHA races).
    async fn requeue_head(&self, item: WorkItem) -> Result<(), StoreError>;

    /// Set-if-absent lease acquisition with TTL. Returns a fresh token on
    /// success, `None` while another holder's lease is live.
    async fn acquire_lease(
        &self,
        key: &RepoKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, StoreError>;

    /// Extends the lease TTL if the stored token matches. Returns `false`
    /// when the lease was lost (expired and possibly taken over).
    async fn refresh_lease(
        &self,
        key: &RepoKey,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Deletes the lease if the stored token matches.
    async fn release_lease(&self, key: &RepoKey, token: &LeaseToken) -> Result<(), StoreError>;

    /// Opens a per-installation cooldown window.
    async fn set_throttle(
        &self,
        installation: InstallationId,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns the active cooldown window end, if any. Expired windows read
    /// as absent.
    async fn get_throttle(
        &self,
        installation: InstallationId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Dead-letters an item: clears its in-flight slot and dedup entry and
    /// appends it to the repo's dead-letter list.
    async fn push_dlq(&self, item: WorkItem, reason: &str) -> Result<(), StoreError>;

    /// Lists a repo's dead letters, oldest first.
    async fn list_dlq(&self, key: &RepoKey) -> Result<Vec<DeadLetter>, StoreError>;

    /// Repos that currently have queued or in-flight work.
    async fn repos_with_work(&self) -> Result<Vec<RepoKey>, StoreError>;

    /// Current list length (not counting the in-flight slot).
    async fn queue_depth(&self, key: &RepoKey) -> Result<usize, StoreError>;

    /// Enqueue time of the oldest queued item, if any.
    async fn oldest_enqueued_at(
        &self,
        key: &RepoKey,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}
