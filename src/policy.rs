//! Per-repository merge policy.
//!
//! Each repository configures the bot through a flat key-value document at
//! `.github/automerge.yml` on the PR's base ref. A missing file means
//! defaults; a malformed file is a configuration error that dead-letters the
//! item rather than silently merging with the wrong settings.
//!
//! Commit title and body templates support named placeholders
//! (`{number}`, `{title}`, `{body}`, `{head}`, `{base}`, `{user}`). Unknown
//! placeholders are rejected at render time so a typo in the policy file
//! fails fast instead of producing a mangled commit message.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PrSnapshot;

/// Well-known path of the policy document on the base ref.
pub const POLICY_PATH: &str = ".github/automerge.yml";

/// Errors raised while loading or applying a repository policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// A known key carried a value of the wrong shape.
    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },

    /// A template referenced a placeholder outside the supported set.
    #[error("unknown placeholder `{{{0}}}` in template")]
    UnknownPlaceholder(String),

    /// A template had an unterminated `{` placeholder.
    #[error("unterminated placeholder in template")]
    UnterminatedPlaceholder,
}

/// How the merge is performed on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Squash,
    Rebase,
    Merge,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
            MergeMethod::Merge => "merge",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "squash" => Some(MergeMethod::Squash),
            "rebase" => Some(MergeMethod::Rebase),
            "merge" => Some(MergeMethod::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-repository merge policy, loaded fresh for every pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPolicy {
    /// PRs must carry this label to be merged.
    pub label: String,

    pub merge_method: MergeMethod,

    /// When true, the PR head must not be behind its base.
    pub require_up_to_date: bool,

    /// When true and the head is behind, request a branch update and re-wait.
    pub update_branch: bool,

    /// When false, a head with no checks at all keeps waiting for the
    /// configured window before it may proceed.
    pub allow_merge_when_no_checks: bool,

    /// Ceiling on time spent waiting for checks.
    pub max_wait_minutes: u64,

    /// Re-poll cadence for statuses and check suites.
    pub poll_interval_seconds: u64,

    pub title_template: String,
    pub body_template: String,
}

impl Default for RepoPolicy {
    fn default() -> Self {
        RepoPolicy {
            label: "automerge".to_string(),
            merge_method: MergeMethod::Squash,
            require_up_to_date: true,
            update_branch: true,
            allow_merge_when_no_checks: false,
            max_wait_minutes: 60,
            poll_interval_seconds: 10,
            title_template: "{title} (#{number})".to_string(),
            body_template: "{body}\n\nAuto-merged for PR #{number}".to_string(),
        }
    }
}

impl RepoPolicy {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_minutes * 60)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// Parses a policy document into a `RepoPolicy`.
///
/// The format is one `key: value` pair per line. Blank lines and `#` comments
/// are skipped, unknown keys are ignored (forward compatibility), and known
/// keys with malformed values are errors.
pub fn parse_policy(text: &str) -> Result<RepoPolicy, PolicyError> {
    let mut policy = RepoPolicy::default();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');

        match key {
            "label" => policy.label = value.to_string(),
            "merge_method" => {
                policy.merge_method =
                    MergeMethod::parse(value).ok_or_else(|| invalid(key, value))?;
            }
            "require_up_to_date" => policy.require_up_to_date = parse_bool(key, value)?,
            "update_branch" => policy.update_branch = parse_bool(key, value)?,
            "allow_merge_when_no_checks" => {
                policy.allow_merge_when_no_checks = parse_bool(key, value)?;
            }
            "max_wait_minutes" => policy.max_wait_minutes = parse_u64(key, value)?,
            "poll_interval_seconds" => policy.poll_interval_seconds = parse_u64(key, value)?,
            "title_template" => policy.title_template = value.to_string(),
            "body_template" => policy.body_template = value.to_string(),
            _ => {}
        }
    }

    Ok(policy)
}

fn invalid(key: &str, value: &str) -> PolicyError {
    PolicyError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, PolicyError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, PolicyError> {
    value.parse().map_err(|_| invalid(key, value))
}

/// Renders a commit message template against a PR snapshot.
///
/// Only the enumerated placeholders are substituted. `\n` escapes in the
/// template (the policy file is line-oriented) become real newlines.
pub fn render_template(template: &str, pr: &PrSnapshot) -> Result<String, PolicyError> {
    let mut out = String::with_capacity(template.len());
    let chars = template.replace("\\n", "\n").chars().collect::<Vec<_>>();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '{' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let Some(end) = chars[i + 1..].iter().position(|&c| c == '}') else {
            return Err(PolicyError::UnterminatedPlaceholder);
        };
        let name: String = chars[i + 1..i + 1 + end].iter().collect();
        out.push_str(&substitute(&name, pr)?);
        i += end + 2;
    }

    Ok(out)
}

fn substitute(name: &str, pr: &PrSnapshot) -> Result<String, PolicyError> {
    match name {
        "number" => Ok(pr.number.0.to_string()),
        "title" => Ok(pr.title.clone()),
        "body" => Ok(pr.body.clone().unwrap_or_default()),
        "head" => Ok(pr.head_ref.clone()),
        "base" => Ok(pr.base_ref.clone()),
        "user" => Ok(pr.user.clone().unwrap_or_default()),
        other => Err(PolicyError::UnknownPlaceholder(other.to_string())),
    }
}
