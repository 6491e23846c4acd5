//! Per-commit processing state and the upload argument queue.
//!
//! Each upload for a commit moves through three states:
//!
//! - "processing": received and currently being parsed.
//! - "processed": parsed into an intermediate report, waiting to be merged
//!   into the master report.
//! - "merged": folded into the master report and removed from the sets.
//!
//! The state is two disjoint KV sets per commit. The predicates derived
//! from their cardinalities drive the two scheduling decisions the pipeline
//! has to make: merging happens in bounded batches (each merge holds a
//! batch of intermediate reports in memory), and postprocessing must fire
//! exactly once per quiet point, when nothing is in flight and nothing is
//! waiting to be merged.
//!
//! The argument queue is the per-commit KV list the ingest tier pushes
//! upload descriptors onto; the dispatcher drains it with single-element
//! pops so concurrent producers are never lost.

use std::collections::BTreeSet;
use std::sync::Arc;

use tributary_kv::{KeyValueStore, Result};
use tributary_types::ReportType;

/// Upper bound on intermediate reports held in memory during one merge.
pub const MERGE_BATCH_SIZE: usize = 5;

/// Cardinalities of the two state sets for one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadNumbers {
    /// Uploads currently being parsed.
    pub processing: u64,
    /// Uploads parsed and waiting to be merged into the master report.
    pub processed: u64,
}

/// A merge should run when no more uploads are expected, or enough have
/// accumulated to fill a batch.
pub fn should_perform_merge(uploads: UploadNumbers) -> bool {
    uploads.processing == 0 || uploads.processed >= MERGE_BATCH_SIZE as u64
}

/// Postprocessing (notifications and other followup work) should run when
/// no more uploads are expected and everything processed has been merged.
pub fn should_trigger_postprocessing(uploads: UploadNumbers) -> bool {
    uploads.processing == 0 && uploads.processed == 0
}

/// The two state sets for one commit.
pub struct ProcessingState {
    kv: Arc<dyn KeyValueStore>,
    repo_id: i64,
    commit_sha: String,
}

impl ProcessingState {
    pub fn new(kv: Arc<dyn KeyValueStore>, repo_id: i64, commit_sha: impl Into<String>) -> Self {
        Self {
            kv,
            repo_id,
            commit_sha: commit_sha.into(),
        }
    }

    fn state_key(&self, state: &str) -> String {
        format!(
            "upload-processing-state/{}/{}/{}",
            self.repo_id, self.commit_sha, state
        )
    }

    pub fn upload_numbers(&self) -> Result<UploadNumbers> {
        Ok(UploadNumbers {
            processing: self.kv.scard(&self.state_key("processing"))?,
            processed: self.kv.scard(&self.state_key("processed"))?,
        })
    }

    /// Add uploads to the "processing" set. Idempotent, so retried tasks
    /// can call it again without harm.
    pub fn mark_uploads_as_processing(&self, upload_ids: &[i64]) -> Result<()> {
        self.kv
            .sadd(&self.state_key("processing"), &members(upload_ids))?;
        Ok(())
    }

    /// Remove uploads from the "processing" set without marking them
    /// processed. Safe to call for ids that were never added; crashed or
    /// retried tasks use this so nothing stays in flight forever.
    pub fn clear_in_progress_uploads(&self, upload_ids: &[i64]) -> Result<()> {
        self.kv
            .srem(&self.state_key("processing"), &members(upload_ids))?;
        Ok(())
    }

    /// Atomically move one upload from "processing" to "processed".
    pub fn mark_upload_as_processed(&self, upload_id: i64) -> Result<()> {
        let moved = self.kv.smove(
            &self.state_key("processing"),
            &self.state_key("processed"),
            &upload_id.to_string(),
        )?;
        if !moved {
            // The id was never in the source set. This happens for tasks
            // that were already in flight when the state tracking was
            // introduced; add it straight to "processed".
            self.kv
                .sadd(&self.state_key("processed"), &[upload_id.to_string()])?;
        }
        Ok(())
    }

    /// Remove merged uploads from the "processed" set.
    pub fn mark_uploads_as_merged(&self, upload_ids: &[i64]) -> Result<()> {
        self.kv
            .srem(&self.state_key("processed"), &members(upload_ids))?;
        Ok(())
    }

    /// Sample up to [`MERGE_BATCH_SIZE`] uploads waiting to be merged.
    /// Order is unspecified; the merge operator does not care.
    pub fn uploads_for_merging(&self) -> Result<BTreeSet<i64>> {
        let sampled = self
            .kv
            .srandmember(&self.state_key("processed"), MERGE_BATCH_SIZE)?;
        Ok(sampled
            .into_iter()
            .filter_map(|id| id.parse().ok())
            .collect())
    }
}

fn members(upload_ids: &[i64]) -> Vec<String> {
    upload_ids.iter().map(|id| id.to_string()).collect()
}

/// The per-commit list of pending upload descriptors.
///
/// Ingest pushes JSON descriptors; the dispatcher pops until empty. The
/// queue key carries the report type except for coverage, which predates
/// report types.
pub struct ArgumentQueue {
    kv: Arc<dyn KeyValueStore>,
    repo_id: i64,
    commit_sha: String,
    report_type: ReportType,
}

impl ArgumentQueue {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        repo_id: i64,
        commit_sha: impl Into<String>,
        report_type: ReportType,
    ) -> Self {
        Self {
            kv,
            repo_id,
            commit_sha: commit_sha.into(),
            report_type,
        }
    }

    pub fn queue_key(&self) -> String {
        match self.report_type {
            ReportType::Coverage => format!("uploads/{}/{}", self.repo_id, self.commit_sha),
            report_type => format!(
                "uploads/{}/{}/{}",
                self.repo_id,
                self.commit_sha,
                report_type.as_str()
            ),
        }
    }

    fn latest_upload_key(&self) -> String {
        match self.report_type {
            ReportType::Coverage => format!("latest_upload/{}/{}", self.repo_id, self.commit_sha),
            report_type => format!(
                "latest_upload/{}/{}/{}",
                self.repo_id,
                self.commit_sha,
                report_type.as_str()
            ),
        }
    }

    pub fn enqueue(&self, descriptor_json: &[u8]) -> Result<()> {
        self.kv.lpush(&self.queue_key(), descriptor_json)?;
        Ok(())
    }

    /// Pop one descriptor; `None` once the queue is empty.
    pub fn pop(&self) -> Result<Option<Vec<u8>>> {
        self.kv.lpop(&self.queue_key())
    }

    /// Drain the queue by repeated single-element pops. The iterator only
    /// terminates when the queue is empty, so it runs arbitrarily long only
    /// if producers keep pushing.
    pub fn drain(&self) -> impl Iterator<Item = Result<Vec<u8>>> + '_ {
        std::iter::from_fn(move || self.pop().transpose())
    }

    pub fn has_pending(&self) -> Result<bool> {
        self.kv.exists(&self.queue_key())
    }

    /// Unix timestamp of the most recent upload, written by the ingest
    /// tier. Drives the dispatcher's debounce window.
    pub fn last_upload_timestamp(&self) -> Result<Option<f64>> {
        let Some(raw) = self.kv.get(&self.latest_upload_key())? else {
            return Ok(None);
        };
        Ok(String::from_utf8_lossy(&raw).parse().ok())
    }

    /// Record an upload arrival time. In production the ingest tier writes
    /// this key; the pipeline itself only reads it.
    pub fn record_upload_timestamp(&self, unix_seconds: f64) -> Result<()> {
        self.kv
            .set(&self.latest_upload_key(), unix_seconds.to_string().as_bytes())
    }
}
