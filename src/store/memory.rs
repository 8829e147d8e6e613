//! In-memory realization of the queue store.
//!
//! Suitable for a single-process deployment and for tests. Lease expiry uses
//! `tokio::time::Instant` so paused-clock tests can drive TTL takeover.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::types::{DedupKey, InstallationId, LeaseToken, RepoKey, WorkItem};

use super::{DeadLetter, EnqueueOutcome, QueueStore, StoreError};

#[derive(Debug)]
struct Lease {
    token: LeaseToken,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct RepoQueue {
    list: VecDeque<WorkItem>,
    dedup: HashSet<DedupKey>,
    inflight: Option<WorkItem>,
    lease: Option<Lease>,
    dlq: Vec<DeadLetter>,
}

impl RepoQueue {
    fn has_work(&self) -> bool {
        !self.list.is_empty() || self.inflight.is_some()
    }
}

#[derive(Debug, Default)]
struct Inner {
    repos: HashMap<RepoKey, RepoQueue>,
    throttles: HashMap<InstallationId, DateTime<Utc>>,
}

/// Mutex-guarded queue state. No await point ever holds the lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic while holding the lock; the queue
        // state is still structurally sound, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, item: WorkItem) -> Result<EnqueueOutcome, StoreError> {
        let mut inner = self.lock();
        let queue = inner.repos.entry(item.key()).or_default();
        let dedup = item.dedup_key();
        if queue.dedup.contains(&dedup) {
            return Ok(EnqueueOutcome::Deduped);
        }
        queue.dedup.insert(dedup);
        queue.list.push_back(item);
        Ok(EnqueueOutcome::Enqueued {
            depth: queue.list.len(),
        })
    }

    async fn pop_head(&self, key: &RepoKey) -> Result<Option<WorkItem>, StoreError> {
        let mut inner = self.lock();
        let Some(queue) = inner.repos.get_mut(key) else {
            return Ok(None);
        };
        if let Some(orphan) = queue.inflight.clone() {
            return Ok(Some(orphan));
        }
        match queue.list.pop_front() {
            Some(item) => {
                queue.inflight = Some(item.clone());
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(queue) = inner.repos.get_mut(&item.key()) {
            let dedup = item.dedup_key();
            if queue
                .inflight
                .as_ref()
                .is_some_and(|i| i.dedup_key() == dedup)
            {
                queue.inflight = None;
            }
            queue.dedup.remove(&dedup);
        }
        Ok(())
    }

    async fn requeue_tail(&self, item: WorkItem) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let queue = inner.repos.entry(item.key()).or_default();
        clear_inflight(queue, &item);
        queue.dedup.insert(item.dedup_key());
        queue.list.push_back(item);
        Ok(())
    }

    async fn requeue_head(&self, item: WorkItem) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let queue = inner.repos.entry(item.key()).or_default();
        clear_inflight(queue, &item);
        queue.dedup.insert(item.dedup_key());
        queue.list.push_front(item);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        key: &RepoKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        let mut inner = self.lock();
        let queue = inner.repos.entry(key.clone()).or_default();
        let now = Instant::now();
        if queue.lease.as_ref().is_some_and(|l| l.expires_at > now) {
            return Ok(None);
        }
        let token = LeaseToken(uuid::Uuid::new_v4().to_string());
        queue.lease = Some(Lease {
            token: token.clone(),
            expires_at: now + ttl,
        });
        Ok(Some(token))
    }

    async fn refresh_lease(
        &self,
        key: &RepoKey,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(queue) = inner.repos.get_mut(key) else {
            return Ok(false);
        };
        let now = Instant::now();
        match &mut queue.lease {
            Some(lease) if lease.token == *token && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &RepoKey, token: &LeaseToken) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(queue) = inner.repos.get_mut(key) {
            if queue.lease.as_ref().is_some_and(|l| l.token == *token) {
                queue.lease = None;
            }
        }
        Ok(())
    }

    async fn set_throttle(
        &self,
        installation: InstallationId,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock().throttles.insert(installation, until);
        Ok(())
    }

    async fn get_throttle(
        &self,
        installation: InstallationId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut inner = self.lock();
        match inner.throttles.get(&installation) {
            Some(until) if *until > Utc::now() => Ok(Some(*until)),
            Some(_) => {
                inner.throttles.remove(&installation);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn push_dlq(&self, item: WorkItem, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let queue = inner.repos.entry(item.key()).or_default();
        clear_inflight(queue, &item);
        queue.dedup.remove(&item.dedup_key());
        queue.dlq.push(DeadLetter {
            item,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_dlq(&self, key: &RepoKey) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(self
            .lock()
            .repos
            .get(key)
            .map(|q| q.dlq.clone())
            .unwrap_or_default())
    }

    async fn repos_with_work(&self) -> Result<Vec<RepoKey>, StoreError> {
        Ok(self
            .lock()
            .repos
            .iter()
            .filter(|(_, q)| q.has_work())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn queue_depth(&self, key: &RepoKey) -> Result<usize, StoreError> {
        Ok(self.lock().repos.get(key).map_or(0, |q| q.list.len()))
    }

    async fn oldest_enqueued_at(
        &self,
        key: &RepoKey,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()
            .repos
            .get(key)
            .and_then(|q| q.list.front())
            .map(|i| i.enqueued_at))
    }
}

fn clear_inflight(queue: &mut RepoQueue, item: &WorkItem) {
    if queue
        .inflight
        .as_ref()
        .is_some_and(|i| i.dedup_key() == item.dedup_key())
    {
        queue.inflight = None;
    }
}
