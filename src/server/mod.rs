//! HTTP surface of the bot.
//!
//! - `POST /webhook` - validates the HMAC signature and hands the event to
//!   the ingress normalizer, acknowledging with 202 before any API work.
//! - `GET /metrics` - Prometheus text exposition.
//! - `GET /healthz` - process liveness, always 200.
//! - `GET /readyz` - 200 only when the store and the API facade both have a
//!   recent successful probe.

use std::sync::Arc;

pub mod health;
pub mod metrics;
pub mod webhook;

use crate::ingress::Ingress;
use crate::metrics::Metrics;

pub use health::{HealthState, healthz_handler, readyz_handler, spawn_probes};
pub use metrics::metrics_handler;
pub use webhook::webhook_handler;

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    webhook_secret: Vec<u8>,
    ingress: Arc<Ingress>,
    metrics: Arc<Metrics>,
    health: Arc<HealthState>,
}

impl AppState {
    pub fn new(
        webhook_secret: Vec<u8>,
        ingress: Arc<Ingress>,
        metrics: Arc<Metrics>,
        health: Arc<HealthState>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                webhook_secret,
                ingress,
                metrics,
                health,
            }),
        }
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.inner.webhook_secret
    }

    pub fn ingress(&self) -> &Arc<Ingress> {
        &self.inner.ingress
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.inner.health
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(app_state)
}
