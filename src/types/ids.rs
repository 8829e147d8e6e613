//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different identifiers (e.g. using
//! an installation id where a PR number is expected) and make queue keys
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an invalid SHA.
#[derive(Debug, Clone, Error)]
#[error("invalid SHA: expected 40 hex characters, got {len} bytes: {preview}")]
pub struct InvalidSha {
    len: usize,
    preview: String,
}

/// A GitHub App installation id. Tenant identity for API auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallationId(pub u64);

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InstallationId {
    fn from(n: u64) -> Self {
        InstallationId(n)
    }
}

/// A pull request number within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrNumber(pub u64);

impl fmt::Display for PrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PrNumber {
    fn from(n: u64) -> Self {
        PrNumber(n)
    }
}

/// A git commit SHA (40 hex characters).
///
/// Construction is only possible via `Sha::parse`, which validates the input
/// and normalizes it to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    /// Parses a string as a SHA, validating that it is exactly 40 hex characters.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidSha> {
        let s = s.into();
        if s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Sha(s.to_ascii_lowercase()))
        } else {
            Err(InvalidSha {
                len: s.len(),
                preview: s.chars().take(20).collect(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short (7-character) form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Sha {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Sha::parse(s).map_err(serde::de::Error::custom)
    }
}

/// A repository identifier (owner/repo format).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// The queue coordinate: an installation plus a repository.
///
/// All durable queue state (FIFO list, dedup set, lease, dead letters) is
/// keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoKey {
    pub installation: InstallationId,
    pub repo: RepoId,
}

impl RepoKey {
    pub fn new(installation: InstallationId, repo: RepoId) -> Self {
        RepoKey { installation, repo }
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.installation, self.repo)
    }
}

/// The canonical dedup key for a queued merge candidate:
/// `installation:owner/repo#number`.
///
/// At any instant at most one item with a given dedup key exists across a
/// repo's FIFO list, dedup set, and in-flight slot combined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(key: &RepoKey, number: PrNumber) -> Self {
        DedupKey(format!(
            "{}:{}/{}#{}",
            key.installation, key.repo.owner, key.repo.repo, number.0
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lease token: a fresh nonce minted by the store on each successful
/// acquisition. Refresh and release are gated on it so a stale holder cannot
/// extend or delete a lease that has been taken over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(inst: u64, owner: &str, repo: &str) -> RepoKey {
        RepoKey::new(InstallationId(inst), RepoId::new(owner, repo))
    }

    #[test]
    fn dedup_key_format() {
        let k = DedupKey::new(&key(42, "octocat", "hello-world"), PrNumber(7));
        assert_eq!(k.as_str(), "42:octocat/hello-world#7");
    }

    #[test]
    fn repo_key_display() {
        assert_eq!(key(9, "a", "b").to_string(), "9:a/b");
    }

    mod sha {
        use super::*;

        proptest! {
            #[test]
            fn serde_roundtrip(s in "[0-9a-f]{40}") {
                let sha = Sha::parse(&s).unwrap();
                let json = serde_json::to_string(&sha).unwrap();
                let parsed: Sha = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(sha, parsed);
            }

            #[test]
            fn parse_rejects_invalid_length(s in "[0-9a-f]{0,39}|[0-9a-f]{41,80}") {
                prop_assert!(Sha::parse(&s).is_err());
            }

            #[test]
            fn parse_normalizes_to_lowercase(s in "[0-9A-Fa-f]{40}") {
                let sha = Sha::parse(&s).unwrap();
                prop_assert_eq!(sha.as_str(), s.to_ascii_lowercase());
            }
        }

        #[test]
        fn short_is_first_seven() {
            let sha = Sha::parse("0123456789abcdef0123456789abcdef01234567").unwrap();
            assert_eq!(sha.short(), "0123456");
        }

        #[test]
        fn deserialize_rejects_invalid_sha() {
            let result: Result<Sha, _> = serde_json::from_str(r#""not-a-sha""#);
            assert!(result.is_err());
        }
    }

    proptest! {
        #[test]
        fn dedup_keys_equal_iff_coordinates_equal(
            a in 1u64..1000, b in 1u64..1000,
            n in 1u64..1000, m in 1u64..1000,
        ) {
            let ka = DedupKey::new(&key(a, "o", "r"), PrNumber(n));
            let kb = DedupKey::new(&key(b, "o", "r"), PrNumber(m));
            prop_assert_eq!(ka == kb, a == b && n == m);
        }
    }
}
