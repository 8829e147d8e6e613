//! Auto-merge bot - main entry point.
//!
//! Runs the HTTP server that accepts webhooks and the worker pool that
//! drains per-repo merge queues.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use automerge_bot::config::Settings;
use automerge_bot::github::{GitHubApi, HttpGitHubClient};
use automerge_bot::ingress::Ingress;
use automerge_bot::metrics::Metrics;
use automerge_bot::pipeline::{Pipeline, PipelineConfig};
use automerge_bot::scheduler::{Scheduler, SchedulerConfig};
use automerge_bot::server::{AppState, HealthState, build_router, spawn_probes};
use automerge_bot::store::{MemoryStore, QueueStore};

/// Cadence of the readiness probe loop.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// How old a successful probe may be before `/readyz` flips to 503.
const PROBE_MAX_AGE: Duration = Duration::from_secs(90);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "automerge_bot=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(Metrics::new().expect("metric registration cannot collide at startup"));
    let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
    let api: Arc<dyn GitHubApi> = match HttpGitHubClient::new(&settings, Arc::clone(&metrics)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("failed to build API client: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    let ingress = Arc::new(Ingress::new(
        Arc::clone(&store),
        Arc::clone(&api),
        Arc::clone(&metrics),
        settings.default_label.clone(),
    ));

    let pipeline = Pipeline::new(
        Arc::clone(&api),
        Arc::clone(&store),
        Arc::clone(&metrics),
        PipelineConfig::from_settings(&settings),
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&metrics),
        pipeline,
        SchedulerConfig::from_settings(&settings),
    ));
    let workers = scheduler.spawn_workers(settings.worker_count, shutdown.clone());
    tracing::info!(workers = settings.worker_count, "worker pool started");

    let health = Arc::new(HealthState::new(PROBE_MAX_AGE));
    let probes = spawn_probes(
        Arc::clone(&store),
        Arc::clone(&api),
        Arc::clone(&health),
        PROBE_INTERVAL,
        shutdown.clone(),
    );

    let app_state = AppState::new(
        settings.webhook_secret.clone(),
        ingress,
        Arc::clone(&metrics),
        health,
    );
    let app = build_router(app_state);

    tracing::info!(addr = %settings.listen_addr, "listening");
    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .expect("failed to bind listen address");

    let server_shutdown = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
    });

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Stop accepting new items and let workers exit at their loop boundary.
    // Anything mid-flight is protected by the lease: if the process dies
    // before a worker finishes, the lease expires and another process
    // resumes the item.
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    let _ = probes.await;
    tracing::info!("shutdown complete");
}
