//! Typed extraction from webhook payloads.
//!
//! Events arrive as untyped JSON documents. The structures here pull out
//! exactly the fields the normalizer needs; everything else in the payload
//! is ignored and never stored.

use serde::Deserialize;

use crate::types::{InstallationId, PrNumber, RepoId};

/// The `repository` object present in most events.
#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub name: String,
    pub owner: OwnerPayload,
}

#[derive(Debug, Deserialize)]
pub struct OwnerPayload {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallationPayload {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct LabelPayload {
    pub name: String,
}

/// A `pull_request` event.
#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequestPayload,
    pub repository: RepositoryPayload,
    pub installation: Option<InstallationPayload>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub number: u64,
    #[serde(default)]
    pub draft: bool,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<LabelPayload>,
}

impl PullRequestPayload {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

/// A `check_suite` event (only `action: completed` is relevant).
#[derive(Debug, Deserialize)]
pub struct CheckSuiteEvent {
    pub action: String,
    pub check_suite: CheckSuitePayload,
    pub repository: RepositoryPayload,
    pub installation: Option<InstallationPayload>,
}

#[derive(Debug, Deserialize)]
pub struct CheckSuitePayload {
    pub head_sha: String,
}

/// A commit `status` event.
#[derive(Debug, Deserialize)]
pub struct StatusEvent {
    pub sha: String,
    pub repository: RepositoryPayload,
    pub installation: Option<InstallationPayload>,
}

impl RepositoryPayload {
    pub fn repo_id(&self) -> RepoId {
        RepoId::new(&self.owner.login, &self.name)
    }
}

impl InstallationPayload {
    pub fn id(&self) -> InstallationId {
        InstallationId(self.id)
    }
}

/// Extracts the PR number newtype.
impl PullRequestPayload {
    pub fn pr_number(&self) -> PrNumber {
        PrNumber(self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pull_request_event_parses() {
        let raw = json!({
            "action": "synchronize",
            "pull_request": {
                "number": 7,
                "draft": false,
                "state": "open",
                "labels": [{"name": "automerge"}]
            },
            "repository": {
                "name": "widgets",
                "owner": {"login": "octocat"}
            },
            "installation": {"id": 42},
            "sender": {"login": "someone"}
        });
        let event: PullRequestEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.action, "synchronize");
        assert_eq!(event.pull_request.pr_number(), PrNumber(7));
        assert!(event.pull_request.has_label("automerge"));
        assert_eq!(event.repository.repo_id(), RepoId::new("octocat", "widgets"));
        assert_eq!(event.installation.unwrap().id(), InstallationId(42));
    }

    #[test]
    fn missing_labels_default_to_empty() {
        let raw = json!({
            "action": "opened",
            "pull_request": {"number": 1, "state": "open"},
            "repository": {"name": "r", "owner": {"login": "o"}}
        });
        let event: PullRequestEvent = serde_json::from_value(raw).unwrap();
        assert!(event.pull_request.labels.is_empty());
        assert!(event.installation.is_none());
    }

    #[test]
    fn check_suite_event_parses() {
        let raw = json!({
            "action": "completed",
            "check_suite": {"head_sha": "a".repeat(40)},
            "repository": {"name": "r", "owner": {"login": "o"}},
            "installation": {"id": 9}
        });
        let event: CheckSuiteEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.check_suite.head_sha, "a".repeat(40));
    }
}
