//! API error taxonomy.
//!
//! The facade distinguishes errors by how the pipeline must react:
//!
//! - `Transport` covers network failures, timeouts, and 5xx responses. The
//!   facade retries these for idempotent calls; once surfaced, they charge
//!   the item's retry budget.
//! - `Throttled` covers 429 and secondary-limit 403 responses. It carries a
//!   cooldown hint and never charges the retry budget; the item waits out
//!   the installation throttle instead.
//! - Merge and update-branch conflicts are typed *outcomes*, not errors -
//!   they are ordinary results the pipeline must decide on.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// An error from the API facade.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Network failure, timeout, or 5xx. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Primary or secondary rate limit. `until` is the platform's cooldown
    /// hint when it provided one.
    #[error("rate limited{}", fmt_until(.until))]
    Throttled { until: Option<DateTime<Utc>> },

    /// The resource does not exist (or is not visible to the installation).
    #[error("not found: {0}")]
    NotFound(String),

    /// The installation is not permitted to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The platform answered with something the facade could not interpret.
    /// Treated like a transport error for retry-budget purposes.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// True if the facade may retry the call (idempotent operations only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

fn fmt_until(until: &Option<DateTime<Utc>>) -> String {
    match until {
        Some(t) => format!(" until {t}"),
        None => String::new(),
    }
}

/// Checks whether a 403 body indicates a secondary rate limit rather than a
/// permission problem.
pub fn is_secondary_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("secondary rate")
        || lower.contains("abuse detection")
        || lower.contains("rate limit")
}
