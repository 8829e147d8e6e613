//! Prometheus metrics for the bot.
//!
//! All metric families live on one `Metrics` value created at startup and
//! passed down through the service context; there is no global registry, so
//! tests can build isolated instances and run in parallel.
//!
//! The family names are a stable contract:
//!
//! | Family | Type | Labels |
//! |--------|------|--------|
//! | `webhook_requests_total` | Counter | `event`, `action`, `code` |
//! | `webhook_invalid_signatures_total` | Counter | |
//! | `events_enqueued_total` / `events_deduped_total` | Counter | `owner`, `repo` |
//! | `queue_depth` / `queue_oldest_age_seconds` | Gauge | `owner`, `repo` |
//! | `worker_lock_{acquired,failed,lost}_total`, `worker_active` | Counter/Gauge | `owner`, `repo` |
//! | `worker_processing_seconds` | Histogram | `phase` |
//! | `retries_total` | Counter | `reason` |
//! | `github_api_requests_total` | Counter | `endpoint`, `status` |
//! | `github_api_latency_seconds` | Histogram | `endpoint` |
//! | `github_rate_limit_{remaining,reset}` | Gauge | `installation` |
//! | `throttles_total` | Counter | `reason` |
//! | `backpressure_active` | Gauge | `installation` |
//! | `branch_updates_total` | Counter | `result` |
//! | `checks_wait_seconds` | Histogram | |
//! | `merge_attempts_total` | Counter | `method`, `result` |
//! | `merges_success_total` | Counter | `method` |
//! | `merges_failed_total` | Counter | `reason` |
//! | `merge_blocked_total` | Counter | |
//! | `starvation_requeue_total` | Counter | `owner`, `repo` |
//! | `dlq_pushes_total` | Counter | `reason` |

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Errors raised by metric registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// All metric families, registered against an owned registry.
pub struct Metrics {
    registry: Registry,

    // Webhook ingress
    pub webhook_requests: IntCounterVec,
    pub webhook_invalid_signatures: IntCounter,

    // Queue
    pub events_enqueued: IntCounterVec,
    pub events_deduped: IntCounterVec,
    pub queue_depth: IntGaugeVec,
    pub queue_oldest_age_seconds: GaugeVec,

    // Workers and leases
    pub worker_lock_acquired: IntCounterVec,
    pub worker_lock_failed: IntCounterVec,
    pub worker_lock_lost: IntCounterVec,
    pub worker_active: IntGaugeVec,
    pub worker_processing_seconds: HistogramVec,
    pub retries: IntCounterVec,

    // GitHub API
    pub github_api_requests: IntCounterVec,
    pub github_api_latency_seconds: HistogramVec,
    pub github_rate_limit_remaining: IntGaugeVec,
    pub github_rate_limit_reset: IntGaugeVec,
    pub throttles: IntCounterVec,
    pub backpressure_active: IntGaugeVec,

    // Merge behavior
    pub branch_updates: IntCounterVec,
    pub checks_wait_seconds: Histogram,
    pub merge_attempts: IntCounterVec,
    pub merges_success: IntCounterVec,
    pub merges_failed: IntCounterVec,
    pub merge_blocked: IntCounter,
    pub starvation_requeue: IntCounterVec,
    pub dlq_pushes: IntCounterVec,

    pub service_info: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        fn counter_vec(
            registry: &Registry,
            name: &str,
            help: &str,
            labels: &[&str],
        ) -> Result<IntCounterVec, MetricsError> {
            let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        }

        fn gauge_vec(
            registry: &Registry,
            name: &str,
            help: &str,
            labels: &[&str],
        ) -> Result<IntGaugeVec, MetricsError> {
            let vec = IntGaugeVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        }

        let webhook_requests = counter_vec(
            &registry,
            "webhook_requests_total",
            "Webhook requests received",
            &["event", "action", "code"],
        )?;
        let webhook_invalid_signatures = IntCounter::new(
            "webhook_invalid_signatures_total",
            "Webhook requests with invalid HMAC signatures",
        )?;
        registry.register(Box::new(webhook_invalid_signatures.clone()))?;

        let events_enqueued = counter_vec(
            &registry,
            "events_enqueued_total",
            "Events accepted and enqueued (after dedup)",
            &["owner", "repo"],
        )?;
        let events_deduped = counter_vec(
            &registry,
            "events_deduped_total",
            "Events collapsed into an already queued or in-flight item",
            &["owner", "repo"],
        )?;
        let queue_depth = gauge_vec(
            &registry,
            "queue_depth",
            "Current queue depth",
            &["owner", "repo"],
        )?;
        let queue_oldest_age_seconds = GaugeVec::new(
            Opts::new(
                "queue_oldest_age_seconds",
                "Age in seconds of the oldest queued item (0 if empty)",
            ),
            &["owner", "repo"],
        )?;
        registry.register(Box::new(queue_oldest_age_seconds.clone()))?;

        let worker_lock_acquired = counter_vec(
            &registry,
            "worker_lock_acquired_total",
            "Per-repo lease acquisitions",
            &["owner", "repo"],
        )?;
        let worker_lock_failed = counter_vec(
            &registry,
            "worker_lock_failed_total",
            "Per-repo lease acquisition failures",
            &["owner", "repo"],
        )?;
        let worker_lock_lost = counter_vec(
            &registry,
            "worker_lock_lost_total",
            "Leases lost mid-pipeline (heartbeat refresh rejected)",
            &["owner", "repo"],
        )?;
        let worker_active = gauge_vec(
            &registry,
            "worker_active",
            "1 while a worker holds the repo lease and is processing",
            &["owner", "repo"],
        )?;
        let worker_processing_seconds = HistogramVec::new(
            HistogramOpts::new("worker_processing_seconds", "Pipeline phase durations").buckets(
                vec![
                    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
                ],
            ),
            &["phase"],
        )?;
        registry.register(Box::new(worker_processing_seconds.clone()))?;
        let retries = counter_vec(
            &registry,
            "retries_total",
            "Items requeued for another attempt, by reason",
            &["reason"],
        )?;

        let github_api_requests = counter_vec(
            &registry,
            "github_api_requests_total",
            "Outbound GitHub API requests",
            &["endpoint", "status"],
        )?;
        let github_api_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "github_api_latency_seconds",
                "Latency of GitHub API requests",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )?;
        registry.register(Box::new(github_api_latency_seconds.clone()))?;
        let github_rate_limit_remaining = gauge_vec(
            &registry,
            "github_rate_limit_remaining",
            "GitHub REST API remaining requests",
            &["installation"],
        )?;
        let github_rate_limit_reset = gauge_vec(
            &registry,
            "github_rate_limit_reset",
            "Epoch seconds when the GitHub rate limit resets",
            &["installation"],
        )?;
        let throttles = counter_vec(
            &registry,
            "throttles_total",
            "Times backpressure engaged, by reason",
            &["reason"],
        )?;
        let backpressure_active = gauge_vec(
            &registry,
            "backpressure_active",
            "1 while a throttle window is active for an installation",
            &["installation"],
        )?;

        let branch_updates = counter_vec(
            &registry,
            "branch_updates_total",
            "Update-branch outcomes",
            &["result"],
        )?;
        let checks_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "checks_wait_seconds",
                "Time spent waiting for checks to settle",
            )
            .buckets(vec![
                5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0,
            ]),
        )?;
        registry.register(Box::new(checks_wait_seconds.clone()))?;
        let merge_attempts = counter_vec(
            &registry,
            "merge_attempts_total",
            "Merge attempts by method and result",
            &["method", "result"],
        )?;
        let merges_success = counter_vec(
            &registry,
            "merges_success_total",
            "Successful merges by method",
            &["method"],
        )?;
        let merges_failed = counter_vec(
            &registry,
            "merges_failed_total",
            "Failed merges by reason",
            &["reason"],
        )?;
        let merge_blocked = IntCounter::new(
            "merge_blocked_total",
            "Items dropped because branch protection blocked the merge",
        )?;
        registry.register(Box::new(merge_blocked.clone()))?;
        let starvation_requeue = counter_vec(
            &registry,
            "starvation_requeue_total",
            "Head items requeued to the tail for starvation control",
            &["owner", "repo"],
        )?;
        let dlq_pushes = counter_vec(
            &registry,
            "dlq_pushes_total",
            "Items dead-lettered, by reason",
            &["reason"],
        )?;

        let service_info = Gauge::with_opts(
            Opts::new("service_info", "Build info labeled on 1").const_label(
                "version",
                option_env!("CARGO_PKG_VERSION").unwrap_or("dev"),
            ),
        )?;
        service_info.set(1.0);
        registry.register(Box::new(service_info.clone()))?;

        Ok(Metrics {
            registry,
            webhook_requests,
            webhook_invalid_signatures,
            events_enqueued,
            events_deduped,
            queue_depth,
            queue_oldest_age_seconds,
            worker_lock_acquired,
            worker_lock_failed,
            worker_lock_lost,
            worker_active,
            worker_processing_seconds,
            retries,
            github_api_requests,
            github_api_latency_seconds,
            github_rate_limit_remaining,
            github_rate_limit_reset,
            throttles,
            backpressure_active,
            branch_updates,
            checks_wait_seconds,
            merge_attempts,
            merges_success,
            merges_failed,
            merge_blocked,
            starvation_requeue,
            dlq_pushes,
            service_info,
        })
    }

    /// Encodes all families in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
