//! Liveness and readiness probes.
//!
//! `/healthz` reports process liveness and is always 200. `/readyz` reports
//! 200 only when both the queue store and the API facade have succeeded in a
//! recent probe; a background task refreshes both marks.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::github::GitHubApi;
use crate::store::QueueStore;

use super::AppState;

/// Tracks when each dependency last answered a probe.
pub struct HealthState {
    max_age: Duration,
    store_ok: Mutex<Option<Instant>>,
    api_ok: Mutex<Option<Instant>>,
}

impl HealthState {
    pub fn new(max_age: Duration) -> Self {
        HealthState {
            max_age,
            store_ok: Mutex::new(None),
            api_ok: Mutex::new(None),
        }
    }

    pub fn mark_store_ok(&self) {
        *self.store_ok.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn mark_api_ok(&self) {
        *self.api_ok.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Ready iff both marks exist and are fresh.
    pub fn ready(&self) -> bool {
        let fresh = |mark: &Mutex<Option<Instant>>| {
            mark.lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some_and(|t| t.elapsed() <= self.max_age)
        };
        fresh(&self.store_ok) && fresh(&self.api_ok)
    }
}

/// Liveness probe: 200 whenever the process is up.
pub async fn healthz_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe.
pub async fn readyz_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.health().ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Spawns the background probe loop feeding the readiness marks.
pub fn spawn_probes(
    store: Arc<dyn QueueStore>,
    api: Arc<dyn GitHubApi>,
    health: Arc<HealthState>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match store.repos_with_work().await {
                Ok(_) => health.mark_store_ok(),
                Err(e) => warn!(error = %e, "store probe failed"),
            }
            match api.ping().await {
                Ok(()) => health.mark_api_ok(),
                Err(e) => warn!(error = %e, "API probe failed"),
            }
            debug!("readiness probes completed");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_until_both_marks() {
        let health = HealthState::new(Duration::from_secs(60));
        assert!(!health.ready());
        health.mark_store_ok();
        assert!(!health.ready());
        health.mark_api_ok();
        assert!(health.ready());
    }

    #[test]
    fn stale_marks_go_unready() {
        let health = HealthState::new(Duration::ZERO);
        health.mark_store_ok();
        health.mark_api_ok();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!health.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_loop_marks_dependencies() {
        use crate::store::MemoryStore;
        use crate::test_utils::FakeGitHub;

        let health = Arc::new(HealthState::new(Duration::from_secs(60)));
        let shutdown = CancellationToken::new();
        let handle = spawn_probes(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeGitHub::new()),
            Arc::clone(&health),
            Duration::from_secs(30),
            shutdown.clone(),
        );

        // Give the first probe iteration a chance to run.
        tokio::task::yield_now().await;
        assert!(health.ready());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
