//! Process configuration, loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("failed to read private key from {path}: {source}")]
    PrivateKey {
        path: String,
        source: std::io::Error,
    },

    #[error("heartbeat interval ({heartbeat:?}) must be less than half the lease TTL ({ttl:?})")]
    HeartbeatTooSlow { heartbeat: Duration, ttl: Duration },

    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Runtime settings for the bot.
///
/// All fields come from environment variables with defaults suited to a
/// single-process deployment; only the GitHub App credentials and the
/// webhook secret are required.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// GitHub App id used to mint installation tokens.
    pub app_id: u64,

    /// PEM contents of the App private key.
    pub private_key: String,

    /// Shared secret for webhook signature verification.
    pub webhook_secret: Vec<u8>,

    /// Base URL of the platform API.
    pub api_base_url: String,

    /// Label the ingress gate requires before enqueueing a PR. The
    /// authoritative label comes from the repo policy under lease.
    pub default_label: String,

    /// TTL of the per-repo lease.
    pub lease_ttl: Duration,

    /// Heartbeat cadence while a pipeline run waits on external conditions.
    /// Must stay under half the lease TTL.
    pub heartbeat: Duration,

    /// Number of parallel scheduler worker loops.
    pub worker_count: usize,

    /// Retry budget before an item is dead-lettered.
    pub max_retries: u32,

    /// Quota floor below which per-installation backpressure engages.
    pub rate_limit_min_remaining: u32,

    /// Fallback cooldown when the API gives no reset hint.
    pub rate_limit_cooldown: Duration,

    /// Upper bound on the random jitter added to throttle windows.
    pub rate_limit_jitter: Duration,

    /// Hard cap on any computed backoff or throttle window.
    pub max_backoff: Duration,

    /// Starvation window: a head item older than this is requeued to the
    /// tail once so siblings can progress.
    pub max_item_window: Duration,

    /// Idle sleep between scheduler sweeps that found no work.
    pub idle_sleep: Duration,

    /// Per-request timeout for facade HTTP calls.
    pub request_timeout: Duration,

    /// Base delay for the facade's retry backoff.
    pub backoff_base: Duration,

    /// Multiplier for the facade's retry backoff.
    pub backoff_factor: f64,

    /// Facade retry attempts for idempotent calls (not counting the first).
    pub api_max_retries: u32,
}

impl Settings {
    /// Loads settings from the environment.
    ///
    /// `APP_PRIVATE_KEY` is a filesystem path to the PEM file; an inline PEM
    /// string is also accepted for development setups.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr = parse_env("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;

        let app_id = parse_env("APP_ID", 0u64)?;
        if app_id == 0 {
            return Err(ConfigError::Missing("APP_ID"));
        }

        let key_var = std::env::var("APP_PRIVATE_KEY")
            .map_err(|_| ConfigError::Missing("APP_PRIVATE_KEY"))?;
        let private_key = if key_var.contains("-----BEGIN") {
            key_var
        } else {
            std::fs::read_to_string(&key_var).map_err(|source| ConfigError::PrivateKey {
                path: key_var.clone(),
                source,
            })?
        };

        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .map_err(|_| ConfigError::Missing("WEBHOOK_SECRET"))?
            .into_bytes();

        let settings = Settings {
            listen_addr,
            app_id,
            private_key,
            webhook_secret,
            api_base_url: std::env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            default_label: std::env::var("AUTOMERGE_LABEL")
                .unwrap_or_else(|_| "automerge".to_string()),
            lease_ttl: secs_env("LOCK_TTL_SECONDS", 60)?,
            heartbeat: secs_env("HEARTBEAT_SECONDS", 15)?,
            worker_count: parse_env("WORKER_COUNT", 4usize)?,
            max_retries: parse_env("MAX_RETRIES", 5u32)?,
            rate_limit_min_remaining: parse_env("RATE_LIMIT_MIN_REMAINING", 50u32)?,
            rate_limit_cooldown: secs_env("RATE_LIMIT_COOLDOWN_SECONDS", 60)?,
            rate_limit_jitter: secs_env("RATE_LIMIT_JITTER_SECONDS", 15)?,
            max_backoff: secs_env("MAX_BACKOFF_SECONDS", 120)?,
            max_item_window: secs_env("MAX_ITEM_WINDOW_SECONDS", 900)?,
            idle_sleep: Duration::from_millis(parse_env("IDLE_SLEEP_MS", 250u64)?),
            request_timeout: secs_env("REQUEST_TIMEOUT_SECONDS", 30)?,
            backoff_base: secs_env("BACKOFF_BASE_SECONDS", 1)?,
            backoff_factor: parse_env("BACKOFF_FACTOR", 2.0f64)?,
            api_max_retries: parse_env("API_MAX_RETRIES", 2u32)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat * 2 >= self.lease_ttl {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat,
                ttl: self.lease_ttl,
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }

    /// Settings with defaults suitable for tests: no credentials, tight
    /// timings.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Settings {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            app_id: 1,
            private_key: String::new(),
            webhook_secret: b"test-secret".to_vec(),
            api_base_url: "https://api.github.example".to_string(),
            default_label: "automerge".to_string(),
            lease_ttl: Duration::from_secs(60),
            heartbeat: Duration::from_secs(15),
            worker_count: 2,
            max_retries: 3,
            rate_limit_min_remaining: 50,
            rate_limit_cooldown: Duration::from_secs(60),
            rate_limit_jitter: Duration::from_secs(15),
            max_backoff: Duration::from_secs(120),
            max_item_window: Duration::from_secs(900),
            idle_sleep: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(10),
            backoff_factor: 2.0,
            api_max_retries: 2,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(default),
    }
}

fn secs_env(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_env(var, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_slow_heartbeat() {
        let mut s = Settings::for_tests();
        s.lease_ttl = Duration::from_secs(20);
        s.heartbeat = Duration::from_secs(10);
        assert!(matches!(
            s.validate(),
            Err(ConfigError::HeartbeatTooSlow { .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut s = Settings::for_tests();
        s.worker_count = 0;
        assert!(matches!(s.validate(), Err(ConfigError::NoWorkers)));
    }

    #[test]
    fn test_defaults_are_valid() {
        Settings::for_tests().validate().unwrap();
    }
}
