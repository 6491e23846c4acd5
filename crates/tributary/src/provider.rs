//! Git-provider seam.
//!
//! Everything the pipeline needs from a git provider goes through
//! [`ProviderClient`]: refreshing commit metadata, installing webhooks,
//! fetching per-commit config, diffs, and CI status. Provider adapters are
//! out of scope for the core; the [`ScriptedProvider`] here answers from
//! fixed data and doubles as the offline/test implementation.
//!
//! Provider failures are classified by behaviour: 4xx-style client errors
//! and missing bots degrade the pipeline (skip the dependent side effect),
//! server errors and rate limits are retried.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tributary_types::CommitRef;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// No bot/integration can authenticate for this repository. Recorded
    /// as a typed commit error; the pipeline continues degraded.
    #[error("repository has no valid bot")]
    NoValidBot,
    #[error("repository not visible to the configured bot")]
    RepoNotFound,
    #[error("provider client error (status {status})")]
    Client { status: u16 },
    #[error("provider server error (status {status})")]
    Server { status: u16 },
    /// All usable provider apps are rate limited until the window resets.
    #[error("provider apps are rate limited")]
    RateLimited,
}

/// Commit metadata as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub branch: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_id: Option<i64>,
}

/// Changed lines per file for one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDiff {
    pub files: BTreeMap<String, BTreeSet<u32>>,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// The operations the pipeline invokes on a git provider.
pub trait ProviderClient: Send + Sync {
    /// Fetch fresh commit metadata, or `None` when the provider has
    /// nothing newer than what we hold.
    fn fetch_commit_info(&self, commit: &CommitRef) -> Result<Option<CommitInfo>>;

    /// Install a webhook for the repository; returns the hook id.
    fn create_webhook(&self, repo_id: i64) -> Result<String>;

    /// Per-commit YAML config source, if the repo carries one.
    fn fetch_commit_config(&self, commit: &CommitRef) -> Result<Option<String>>;

    fn get_commit_diff(&self, commit: &CommitRef) -> Result<CommitDiff>;

    /// CI outcome: `None` while unknown/running, `Some(passed)` once done.
    fn get_ci_status(&self, commit: &CommitRef) -> Result<Option<bool>>;
}

#[derive(Default)]
struct Scripted {
    commit_info: Option<CommitInfo>,
    commit_config: Option<String>,
    diff: Option<CommitDiff>,
    ci_status: Option<bool>,
    fail_with: Option<fn() -> ProviderError>,
    webhooks_created: u32,
}

/// Provider that answers from fixed data. Serves tests and offline runs;
/// setters cover the failure modes the pipeline must degrade through.
#[derive(Default)]
pub struct ScriptedProvider {
    inner: Mutex<Scripted>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_commit_info(&self, info: CommitInfo) {
        self.inner.lock().unwrap().commit_info = Some(info);
    }

    pub fn set_commit_config(&self, yaml: &str) {
        self.inner.lock().unwrap().commit_config = Some(yaml.to_string());
    }

    pub fn set_diff(&self, diff: CommitDiff) {
        self.inner.lock().unwrap().diff = Some(diff);
    }

    pub fn set_ci_status(&self, status: Option<bool>) {
        self.inner.lock().unwrap().ci_status = status;
    }

    /// Make every call fail with the given error constructor.
    pub fn fail_with(&self, error: fn() -> ProviderError) {
        self.inner.lock().unwrap().fail_with = Some(error);
    }

    pub fn clear_failure(&self) {
        self.inner.lock().unwrap().fail_with = None;
    }

    pub fn webhooks_created(&self) -> u32 {
        self.inner.lock().unwrap().webhooks_created
    }

    fn check(&self) -> Result<()> {
        if let Some(error) = self.inner.lock().unwrap().fail_with {
            return Err(error());
        }
        Ok(())
    }
}

impl ProviderClient for ScriptedProvider {
    fn fetch_commit_info(&self, _commit: &CommitRef) -> Result<Option<CommitInfo>> {
        self.check()?;
        Ok(self.inner.lock().unwrap().commit_info.clone())
    }

    fn create_webhook(&self, _repo_id: i64) -> Result<String> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        inner.webhooks_created += 1;
        Ok(format!("hook-{}", inner.webhooks_created))
    }

    fn fetch_commit_config(&self, _commit: &CommitRef) -> Result<Option<String>> {
        self.check()?;
        Ok(self.inner.lock().unwrap().commit_config.clone())
    }

    fn get_commit_diff(&self, _commit: &CommitRef) -> Result<CommitDiff> {
        self.check()?;
        Ok(self.inner.lock().unwrap().diff.clone().unwrap_or_default())
    }

    fn get_ci_status(&self, _commit: &CommitRef) -> Result<Option<bool>> {
        self.check()?;
        Ok(self.inner.lock().unwrap().ci_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_provider_returns_configured_data() {
        let provider = ScriptedProvider::new();
        provider.set_ci_status(Some(true));
        provider.set_commit_info(CommitInfo {
            branch: "main".to_string(),
            message: "feat".to_string(),
            pull_id: Some(12),
        });

        let commit = CommitRef::new(1, "abc");
        assert_eq!(provider.get_ci_status(&commit).expect("ci"), Some(true));
        let info = provider.fetch_commit_info(&commit).expect("info").expect("some");
        assert_eq!(info.pull_id, Some(12));
    }

    #[test]
    fn scripted_provider_injects_failures() {
        let provider = ScriptedProvider::new();
        provider.fail_with(|| ProviderError::NoValidBot);
        let err = provider
            .get_ci_status(&CommitRef::new(1, "abc"))
            .expect_err("must fail");
        assert!(matches!(err, ProviderError::NoValidBot));

        provider.clear_failure();
        assert!(provider.get_ci_status(&CommitRef::new(1, "abc")).is_ok());
    }

    #[test]
    fn webhook_ids_are_distinct() {
        let provider = ScriptedProvider::new();
        let first = provider.create_webhook(1).expect("hook");
        let second = provider.create_webhook(1).expect("hook");
        assert_ne!(first, second);
        assert_eq!(provider.webhooks_created(), 2);
    }
}
