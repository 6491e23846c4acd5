//! Per-commit upload context.
//!
//! Bundles the coordination surfaces one `(repo, sha, report_type)` triple
//! owns — argument queue, locks, debounce timestamp — and the descriptor
//! normalisation the dispatcher performs before any processor runs:
//! inline KV blobs are copied into the object store and the descriptor is
//! rewritten to a `storage_path`, and ingest secrets are stripped.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use chrono::Utc;
use tributary_config::UserConfig;
use tributary_kv::KeyValueStore;
use tributary_lock::{LockKind, LockManager};
use tributary_retry::debounce_countdown;
use tributary_state::ArgumentQueue;
use tributary_types::{CommitRef, ReportType, UploadDescriptor};

use crate::runner::Kwargs;
use crate::storage::{ObjectStore, raw_upload_path};

/// Everything a task handler needs, threaded explicitly instead of living
/// in process globals. Built once per worker and shared by reference.
pub struct Services {
    pub kv: Arc<dyn KeyValueStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn crate::metadata::MetadataStore>,
    pub provider: Arc<dyn crate::provider::ProviderClient>,
    pub parser: Arc<dyn crate::report::ReportParser>,
    pub reports: Arc<dyn crate::report::ReportStore>,
    pub runner: Arc<dyn crate::runner::TaskRunner>,
    /// Installation-level config, the base layer under per-commit config.
    pub install_config: UserConfig,
    /// Repos enrolled in the parallel-processing shadow experiment.
    pub parallel_processing_repos: std::collections::HashSet<i64>,
}

pub struct UploadContext {
    pub commit: CommitRef,
    pub report_type: ReportType,
    pub report_code: Option<String>,
    kv: Arc<dyn KeyValueStore>,
    queue: ArgumentQueue,
    locks: LockManager,
}

impl UploadContext {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        commit: CommitRef,
        report_type: ReportType,
        report_code: Option<String>,
    ) -> Self {
        let queue = ArgumentQueue::new(
            Arc::clone(&kv),
            commit.repo_id,
            commit.commit_sha.clone(),
            report_type,
        );
        let locks = LockManager::new(
            Arc::clone(&kv),
            commit.repo_id,
            commit.commit_sha.clone(),
            report_type,
        );
        Self {
            commit,
            report_type,
            report_code,
            kv,
            queue,
            locks,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn queue(&self) -> &ArgumentQueue {
        &self.queue
    }

    /// Whether a processor currently holds this commit's processing lock.
    pub fn is_currently_processing(&self) -> Result<bool> {
        Ok(self.locks.is_locked(LockKind::UploadProcessing)?)
    }

    pub fn has_pending_jobs(&self) -> Result<bool> {
        Ok(self.queue.has_pending()?)
    }

    /// Drain the argument queue into parsed descriptors. Entries that fail
    /// to parse are dropped with a warning; one malformed upload must not
    /// wedge the commit.
    pub fn arguments_list(&self) -> Result<Vec<UploadDescriptor>> {
        let mut descriptors = Vec::new();
        for entry in self.queue.drain() {
            let bytes = entry.context("failed to pop upload descriptor")?;
            match UploadDescriptor::from_json(&bytes) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(error) => {
                    tracing::warn!(
                        repo_id = self.commit.repo_id,
                        commit_sha = %self.commit.commit_sha,
                        %error,
                        "dropping malformed upload descriptor"
                    );
                }
            }
        }
        Ok(descriptors)
    }

    /// Normalise one descriptor: move an inline KV blob to stable object
    /// storage and strip ingest secrets.
    pub fn normalize_arguments(
        &self,
        storage: &dyn ObjectStore,
        mut descriptor: UploadDescriptor,
    ) -> Result<UploadDescriptor> {
        if let Some(redis_key) = descriptor.redis_key.take() {
            let content = self
                .kv
                .get(&redis_key)?
                .with_context(|| format!("inline upload blob {redis_key} is gone"))?;
            let report_id = descriptor
                .extra
                .get("reportid")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("upload-{}", descriptor.upload_id.unwrap_or(0)));
            let path = raw_upload_path(
                Utc::now(),
                &self.commit.repo_id.to_string(),
                &self.commit.commit_sha,
                &report_id,
            );
            storage
                .write(&path, &content)
                .context("failed to move inline upload blob to storage")?;
            tracing::info!(
                repo_id = self.commit.repo_id,
                commit_sha = %self.commit.commit_sha,
                path,
                "moved inline upload content to storage"
            );
            descriptor.storage_path = Some(path);
        }
        descriptor.token = None;
        Ok(descriptor)
    }

    /// How long to debounce before committing to a task graph, if the
    /// latest upload is younger than the configured processing delay.
    pub fn should_debounce(&self, config: &UserConfig) -> Result<Option<Duration>> {
        let Some(processing_delay) = config.upload_processing_delay() else {
            return Ok(None);
        };
        let Some(last_upload) = self.queue.last_upload_timestamp()? else {
            return Ok(None);
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let age = Duration::from_secs_f64((now - last_upload).max(0.0));
        if age < processing_delay {
            Ok(Some(debounce_countdown(processing_delay, age)))
        } else {
            Ok(None)
        }
    }

    /// The kwargs every task of this commit's pipeline carries.
    pub fn base_kwargs(&self) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("repoid".to_string(), self.commit.repo_id.into());
        kwargs.insert(
            "commitid".to_string(),
            self.commit.commit_sha.clone().into(),
        );
        kwargs.insert(
            "report_type".to_string(),
            self.report_type.as_str().into(),
        );
        if let Some(report_code) = &self.report_code {
            kwargs.insert("report_code".to_string(), report_code.clone().into());
        }
        kwargs
    }
}
