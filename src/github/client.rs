//! reqwest-backed implementation of the API facade.
//!
//! Authentication follows the GitHub App model: a short-lived RS256 JWT
//! mints per-installation access tokens, which are cached until shortly
//! before expiry. The cache lives behind an async RwLock; the client itself
//! is cheap to share across workers.
//!
//! Every response's rate-limit headers are recorded into gauges and a shared
//! snapshot. Throttling responses (429, or 403 carrying a rate-limit
//! message or an exhausted quota) become `ApiError::Throttled` with the
//! platform's cooldown hint attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::{Method, StatusCode, header::HeaderMap};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::policy::MergeMethod;
use crate::types::{
    CheckSuite, CombinedStatus, InstallationId, PrNumber, PrSnapshot, RepoId, Sha,
};

use super::error::{ApiError, is_secondary_limit};
use super::retry::{RetryConfig, retry_idempotent};
use super::types::{
    CheckSuitesResponse, CombinedStatusResponse, CommitPullResponse, CompareResponse,
    ContentsResponse, ErrorMessageResponse, InstallationTokenResponse, MergeOutcome, PullResponse,
    RateLimitSnapshot, UpdateBranchOutcome, parse_rate_limit,
};
use super::GitHubApi;

/// Errors raised while constructing the client.
#[derive(Debug, Error)]
pub enum ClientInitError {
    #[error("invalid App private key: {0}")]
    PrivateKey(#[from] jsonwebtoken::errors::Error),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: u64,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Seconds of validity a cached token must retain to be reused.
const TOKEN_REFRESH_BUFFER_SECS: i64 = 300;

/// True when a cached token is still comfortably inside its validity window.
fn token_fresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - now > ChronoDuration::seconds(TOKEN_REFRESH_BUFFER_SECS)
}

/// Computes the throttle hint for a limited response: `Retry-After` wins,
/// then the quota reset timestamp.
fn throttle_hint(
    retry_after: Option<&str>,
    reset_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(secs) = retry_after.and_then(|s| s.trim().parse::<i64>().ok()) {
        return Some(now + ChronoDuration::seconds(secs));
    }
    reset_at
}

/// Maps a 422 update-branch body onto the outcome: the platform uses the
/// same status for "nothing to update" and for a conflicting base merge.
fn classify_update_branch_422(message: &str) -> UpdateBranchOutcome {
    let lower = message.to_lowercase();
    if lower.contains("up to date") || lower.contains("nothing to") {
        UpdateBranchOutcome::NotBehind
    } else {
        UpdateBranchOutcome::Conflict
    }
}

struct ApiResponse {
    status: StatusCode,
    body: Value,
}

impl ApiResponse {
    fn message(&self) -> String {
        serde_json::from_value::<ErrorMessageResponse>(self.body.clone())
            .map(|m| m.message)
            .unwrap_or_default()
    }

    fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_value(self.body.clone()).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// The production API facade.
pub struct HttpGitHubClient {
    http: reqwest::Client,
    base_url: String,
    app_id: u64,
    encoding_key: EncodingKey,
    token_cache: tokio::sync::RwLock<HashMap<InstallationId, CachedToken>>,
    rate: Mutex<Option<RateLimitSnapshot>>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
}

impl HttpGitHubClient {
    pub fn new(settings: &Settings, metrics: Arc<Metrics>) -> Result<Self, ClientInitError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("automerge-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let encoding_key = EncodingKey::from_rsa_pem(settings.private_key.as_bytes())?;
        Ok(HttpGitHubClient {
            http,
            base_url: settings.api_base_url.clone(),
            app_id: settings.app_id,
            encoding_key,
            token_cache: tokio::sync::RwLock::new(HashMap::new()),
            rate: Mutex::new(None),
            metrics,
            retry: RetryConfig::new(
                settings.api_max_retries,
                settings.backoff_base,
                settings.max_backoff,
                settings.backoff_factor,
            ),
        })
    }

    fn app_jwt(&self) -> Result<String, ApiError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iss: self.app_id,
            // Issued in the past to absorb clock skew.
            iat: now - 60,
            exp: now + 600,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| ApiError::Decode(format!("failed to sign app JWT: {e}")))
    }

    async fn installation_token(
        &self,
        installation: InstallationId,
    ) -> Result<String, ApiError> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.get(&installation) {
                if token_fresh(cached.expires_at, Utc::now()) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let jwt = self.app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.base_url, installation
        );
        debug!(%installation, "minting installation access token");

        let response = self
            .observed(
                "POST /app/installations/{id}/access_tokens",
                installation,
                self.http
                    .post(&url)
                    .bearer_auth(&jwt)
                    .header("Accept", "application/vnd.github+json"),
            )
            .await?;

        if !response.status.is_success() {
            return Err(unexpected(&response));
        }
        let minted: InstallationTokenResponse = response.decode()?;
        let expires_at = minted
            .expires_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(1));

        let mut cache = self.token_cache.write().await;
        cache.insert(
            installation,
            CachedToken {
                token: minted.token.clone(),
                expires_at,
            },
        );
        Ok(minted.token)
    }

    /// Sends one request, observing latency, status, and quota headers.
    /// Throttling responses come back as `ApiError::Throttled`; 5xx as
    /// `ApiError::Transport`; everything else is returned for the caller to
    /// interpret.
    async fn observed(
        &self,
        endpoint: &'static str,
        installation: InstallationId,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse, ApiError> {
        let started = Instant::now();
        let result = request.send().await;
        let elapsed = started.elapsed().as_secs_f64();
        self.metrics
            .github_api_latency_seconds
            .with_label_values(&[endpoint])
            .observe(elapsed);

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.metrics
                    .github_api_requests
                    .with_label_values(&[endpoint, "exc"])
                    .inc();
                return Err(ApiError::Transport(e.to_string()));
            }
        };

        let status = response.status();
        self.metrics
            .github_api_requests
            .with_label_values(&[endpoint, status.as_str()])
            .inc();

        let rate = self.observe_rate_headers(installation, response.headers());
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        let api_response = ApiResponse { status, body };

        if status.is_server_error() {
            return Err(ApiError::Transport(format!(
                "HTTP {status}: {}",
                api_response.message()
            )));
        }

        let quota_exhausted = rate.is_some_and(|r| r.remaining == 0);
        let limited = status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN
                && (is_secondary_limit(&api_response.message()) || quota_exhausted));
        if limited {
            let until = throttle_hint(
                retry_after.as_deref(),
                rate.and_then(|r| r.reset_at),
                Utc::now(),
            );
            warn!(%installation, ?until, "API throttling response");
            return Err(ApiError::Throttled { until });
        }

        Ok(api_response)
    }

    fn observe_rate_headers(
        &self,
        installation: InstallationId,
        headers: &HeaderMap,
    ) -> Option<RateLimitSnapshot> {
        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok());
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok());
        let snapshot = parse_rate_limit(remaining, reset)?;

        let label = installation.to_string();
        self.metrics
            .github_rate_limit_remaining
            .with_label_values(&[&label])
            .set(snapshot.remaining as i64);
        if let Some(reset_at) = snapshot.reset_at {
            self.metrics
                .github_rate_limit_reset
                .with_label_values(&[&label])
                .set(reset_at.timestamp());
        }
        *self.rate.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        Some(snapshot)
    }

    async fn authed(
        &self,
        installation: InstallationId,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let token = self.installation_token(installation).await?;
        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", "application/vnd.github+json");
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request)
    }

    /// One authenticated call, no retries.
    async fn call(
        &self,
        installation: InstallationId,
        method: Method,
        endpoint: &'static str,
        path: String,
        body: Option<Value>,
    ) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .authed(installation, method, &url, body.as_ref())
            .await?;
        self.observed(endpoint, installation, request).await
    }

    /// An authenticated call retried on transport errors. Only for
    /// idempotent operations.
    async fn call_idempotent(
        &self,
        installation: InstallationId,
        method: Method,
        endpoint: &'static str,
        path: String,
        body: Option<Value>,
    ) -> Result<ApiResponse, ApiError> {
        retry_idempotent(self.retry, || {
            self.call(
                installation,
                method.clone(),
                endpoint,
                path.clone(),
                body.clone(),
            )
        })
        .await
    }

    async fn behind_by(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        base_ref: &str,
        head_sha: &Sha,
    ) -> Result<u32, ApiError> {
        let response = self
            .call_idempotent(
                installation,
                Method::GET,
                "GET /repos/{owner}/{repo}/compare/{base}...{head}",
                format!(
                    "/repos/{}/{}/compare/{}...{}",
                    repo.owner, repo.repo, base_ref, head_sha
                ),
                None,
            )
            .await?;
        if !response.status.is_success() {
            return Err(unexpected(&response));
        }
        let compared: CompareResponse = response.decode()?;
        Ok(compared.behind_by)
    }
}

fn unexpected(response: &ApiResponse) -> ApiError {
    let message = response.message();
    match response.status {
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ApiError::Forbidden(message),
        status => ApiError::Decode(format!("HTTP {status}: {message}")),
    }
}

#[async_trait]
impl GitHubApi for HttpGitHubClient {
    async fn get_pr(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        number: PrNumber,
    ) -> Result<PrSnapshot, ApiError> {
        let response = self
            .call_idempotent(
                installation,
                Method::GET,
                "GET /repos/{owner}/{repo}/pulls/{number}",
                format!("/repos/{}/{}/pulls/{}", repo.owner, repo.repo, number.0),
                None,
            )
            .await?;
        if !response.status.is_success() {
            return Err(unexpected(&response));
        }
        let pull: PullResponse = response.decode()?;

        // The pulls endpoint says *whether* the head is behind; the compare
        // endpoint says by how much.
        let behind_by = if pull.mergeable_state.as_deref() == Some("behind") {
            let head_sha = Sha::parse(&pull.head.sha)
                .map_err(|e| ApiError::Decode(format!("bad head sha: {e}")))?;
            self.behind_by(installation, repo, &pull.base.ref_name, &head_sha)
                .await
                .unwrap_or(1)
        } else {
            0
        };
        pull.into_snapshot(behind_by)
    }

    async fn combined_status(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<CombinedStatus, ApiError> {
        let response = self
            .call_idempotent(
                installation,
                Method::GET,
                "GET /repos/{owner}/{repo}/commits/{sha}/status",
                format!("/repos/{}/{}/commits/{}/status", repo.owner, repo.repo, sha),
                None,
            )
            .await?;
        if !response.status.is_success() {
            return Err(unexpected(&response));
        }
        let combined: CombinedStatusResponse = response.decode()?;
        Ok(combined.into_status())
    }

    async fn check_suites(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<Vec<CheckSuite>, ApiError> {
        let response = self
            .call_idempotent(
                installation,
                Method::GET,
                "GET /repos/{owner}/{repo}/commits/{sha}/check-suites",
                format!(
                    "/repos/{}/{}/commits/{}/check-suites",
                    repo.owner, repo.repo, sha
                ),
                None,
            )
            .await?;
        if !response.status.is_success() {
            return Err(unexpected(&response));
        }
        let suites: CheckSuitesResponse = response.decode()?;
        Ok(suites
            .check_suites
            .into_iter()
            .map(|s| s.into_suite())
            .collect())
    }

    async fn repo_file(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>, ApiError> {
        let response = self
            .call_idempotent(
                installation,
                Method::GET,
                "GET /repos/{owner}/{repo}/contents/{path}",
                format!(
                    "/repos/{}/{}/contents/{}?ref={}",
                    repo.owner, repo.repo, path, git_ref
                ),
                None,
            )
            .await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status.is_success() {
            return Err(unexpected(&response));
        }
        let contents: ContentsResponse = response.decode()?;
        if contents.encoding.as_deref() != Some("base64") {
            return Err(ApiError::Decode(format!(
                "unsupported contents encoding: {:?}",
                contents.encoding
            )));
        }
        let compact: String = contents
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let raw = general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| ApiError::Decode(format!("bad base64 content: {e}")))?;
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| ApiError::Decode(format!("content is not UTF-8: {e}")))
    }

    async fn update_branch(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        number: PrNumber,
    ) -> Result<UpdateBranchOutcome, ApiError> {
        let response = self
            .call_idempotent(
                installation,
                Method::PUT,
                "PUT /repos/{owner}/{repo}/pulls/{number}/update-branch",
                format!(
                    "/repos/{}/{}/pulls/{}/update-branch",
                    repo.owner, repo.repo, number.0
                ),
                Some(json!({})),
            )
            .await?;
        match response.status {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(UpdateBranchOutcome::Ok),
            StatusCode::UNPROCESSABLE_ENTITY => {
                Ok(classify_update_branch_422(&response.message()))
            }
            _ => Err(unexpected(&response)),
        }
    }

    async fn merge_pr(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        number: PrNumber,
        expected_head: &Sha,
        method: MergeMethod,
        title: &str,
        body: &str,
    ) -> Result<MergeOutcome, ApiError> {
        // Exactly one attempt: the merge is not idempotent.
        let response = self
            .call(
                installation,
                Method::PUT,
                "PUT /repos/{owner}/{repo}/pulls/{number}/merge",
                format!(
                    "/repos/{}/{}/pulls/{}/merge",
                    repo.owner, repo.repo, number.0
                ),
                Some(json!({
                    "merge_method": method.as_str(),
                    "commit_title": title,
                    "commit_message": body,
                    "sha": expected_head.as_str(),
                })),
            )
            .await?;
        match response.status {
            StatusCode::OK | StatusCode::CREATED => Ok(MergeOutcome::Merged),
            StatusCode::CONFLICT => Ok(MergeOutcome::MismatchedSha),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::UNPROCESSABLE_ENTITY => {
                Ok(MergeOutcome::NotMergeable)
            }
            StatusCode::FORBIDDEN => Ok(MergeOutcome::Forbidden),
            _ => Err(unexpected(&response)),
        }
    }

    async fn prs_for_commit(
        &self,
        installation: InstallationId,
        repo: &RepoId,
        sha: &Sha,
    ) -> Result<Vec<PrNumber>, ApiError> {
        let response = self
            .call_idempotent(
                installation,
                Method::GET,
                "GET /repos/{owner}/{repo}/commits/{sha}/pulls",
                format!("/repos/{}/{}/commits/{}/pulls", repo.owner, repo.repo, sha),
                None,
            )
            .await?;
        if !response.status.is_success() {
            return Err(unexpected(&response));
        }
        let pulls: Vec<CommitPullResponse> = response.decode()?;
        Ok(pulls
            .into_iter()
            .filter(|p| p.state == "open")
            .map(|p| PrNumber(p.number))
            .collect())
    }

    fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        *self.rate.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let jwt = self.app_jwt()?;
        let url = format!("{}/app", self.base_url);
        let response = self
            .observed(
                "GET /app",
                InstallationId(0),
                self.http
                    .get(&url)
                    .bearer_auth(&jwt)
                    .header("Accept", "application/vnd.github+json"),
            )
            .await?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(unexpected(&response))
        }
    }
}

impl std::fmt::Debug for HttpGitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGitHubClient")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}
