//! Webhook endpoint handler.
//!
//! Signature verification happens before any parsing or queue work, and the
//! response never waits on the platform API. Payload contents are never
//! logged; log lines carry only the event type, action, and coordinates.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ingress::verify_signature;

use super::AppState;

const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Errors that reject a webhook delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Missing required header.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// Missing or invalid signature.
    #[error("invalid signature")]
    InvalidSignature,

    /// The body is not valid JSON.
    #[error("invalid JSON payload")]
    InvalidJson,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidJson => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Accepts a webhook delivery: verify, normalize, enqueue, 202.
pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let metrics = Arc::clone(state.metrics());
    let record = |event: &str, action: &str, code: StatusCode| {
        metrics
            .webhook_requests
            .with_label_values(&[event, action, code.as_str()])
            .inc();
    };

    let Some(event) = header_str(&headers, HEADER_EVENT) else {
        record("unknown", "unknown", StatusCode::BAD_REQUEST);
        return Err(WebhookError::MissingHeader(HEADER_EVENT));
    };

    let signature = header_str(&headers, HEADER_SIGNATURE).unwrap_or_default();
    if !verify_signature(&body, &signature, state.webhook_secret()) {
        state.metrics().webhook_invalid_signatures.inc();
        record(&event, "unknown", StatusCode::UNAUTHORIZED);
        warn!(event, "webhook signature verification failed");
        return Err(WebhookError::InvalidSignature);
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            record(&event, "unknown", StatusCode::BAD_REQUEST);
            return Err(WebhookError::InvalidJson);
        }
    };
    let action = payload
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or("unknown")
        .to_string();

    if let Some(delivery) = header_str(&headers, HEADER_DELIVERY) {
        debug!(event, action, delivery, "webhook received");
    }

    let outcome = state.ingress().handle_event(&event, payload).await;
    debug!(event, action, ?outcome, "webhook normalized");

    record(&event, &action, StatusCode::ACCEPTED);
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
