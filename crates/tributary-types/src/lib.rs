//! Core domain types for the tributary upload pipeline.
//!
//! Everything that crosses a task boundary lives here: report kinds, upload
//! descriptors as they appear on the argument queue, the flat `Commit` and
//! `Upload` rows the pipeline reads and writes, and the small JSON replies
//! every task returns.
//!
//! Rows are deliberately flat records keyed by id. The pipeline never holds
//! an object graph; join-sets are fetched explicitly at call sites.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of data an upload carries. Each kind runs its own pipeline
/// per commit; they only share the commit's locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    #[default]
    Coverage,
    BundleAnalysis,
    TestResults,
}

impl ReportType {
    /// The wire name used in KV keys and task kwargs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Coverage => "coverage",
            ReportType::BundleAnalysis => "bundle_analysis",
            ReportType::TestResults => "test_results",
        }
    }
}

impl std::fmt::Display for ReportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a commit across every store: `(repo_id, commit_sha)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    pub repo_id: i64,
    pub commit_sha: String,
}

impl CommitRef {
    pub fn new(repo_id: i64, commit_sha: impl Into<String>) -> Self {
        Self {
            repo_id,
            commit_sha: commit_sha.into(),
        }
    }
}

/// Upload lifecycle. Terminal states are `Merged` and `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    Queued,
    Processing,
    Processed,
    Merged,
    Errored,
}

/// One upload row. Created by the ingest tier; the pipeline only moves its
/// state forward and fills in `storage_path` / `order_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub upload_id: i64,
    pub repo_id: i64,
    pub commit_sha: String,
    /// Location of the raw content in the object store. Absent until the
    /// dispatcher has normalised an inline blob into stable storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    /// Grouping key for local uploads; uploads with different codes run
    /// independent pipelines and never notify.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_code: Option<String>,
    pub report_type: ReportType,
    pub state: UploadState,
    /// Session id in the master report, assigned at merge time (serial) or
    /// pre-allocated by the dispatcher (parallel).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<u32>,
    /// Parser diagnostics recorded when processing fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Commit row state as the pipeline observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    #[default]
    Pending,
    Complete,
    Error,
    Skipped,
}

/// The slice of a commit row the pipeline reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub repo_id: i64,
    pub commit_sha: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_id: Option<i64>,
    pub message: String,
    pub state: CommitState,
    pub notified: bool,
    /// Number of sessions already present in the persisted master report.
    /// Drives the `after_n_builds` notification gate.
    pub session_count: u32,
    /// Whether a provider webhook is installed for the repository. Gates
    /// the wait-for-ci retry schedule.
    pub has_webhook: bool,
}

/// Typed commit errors, recorded at most once per (commit, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitErrorKind {
    RepoBotInvalid,
    InvalidYaml,
}

/// An upload descriptor as it sits on the argument queue: `upload_id` plus
/// arbitrary opaque fields forwarded to the parser.
///
/// The ingest tier may stash the raw content in the KV store under
/// `redis_key`; the dispatcher copies that blob to the object store and
/// rewrites the descriptor to a `storage_path` before any processor sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<i64>,
    /// Database primary key, stamped by the dispatcher once the row exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_pk: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_key: Option<String>,
    /// Ingest auth token. Stripped by the dispatcher before enqueueing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<i64>,
    /// Everything else is carried opaquely to the parser.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl UploadDescriptor {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Outcome of processing one descriptor, accumulated across the chain so the
/// finisher can tell how many uploads succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub upload_id: i64,
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProcessingErrorInfo>,
}

/// Parser/storage diagnostics captured on the accumulator instead of
/// failing the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "code")]
pub enum ProcessingErrorInfo {
    FileNotInStorage,
    ParserError { message: String },
}

/// Every task returns a small JSON-serialisable reply with at minimum
/// `successful`; the variants add their task-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskReply {
    Dispatch {
        successful: bool,
        was_setup: bool,
        was_updated: bool,
        tasks_were_scheduled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Process {
        successful: bool,
        processings_so_far: Vec<ProcessingResult>,
    },
    Finish {
        successful: bool,
        notifications_called: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TaskReply {
    /// Dispatcher reply for the paths that schedule nothing.
    pub fn nothing_scheduled(reason: Option<&str>) -> Self {
        TaskReply::Dispatch {
            successful: true,
            was_setup: false,
            was_updated: false,
            tasks_were_scheduled: false,
            reason: reason.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_type_wire_names_are_stable() {
        assert_eq!(ReportType::Coverage.as_str(), "coverage");
        assert_eq!(ReportType::BundleAnalysis.as_str(), "bundle_analysis");
        assert_eq!(ReportType::TestResults.as_str(), "test_results");
    }

    #[test]
    fn descriptor_roundtrips_with_unknown_fields() {
        let raw = br#"{"upload_id": 7, "redis_key": "blob/7", "flags": "unit,rust", "build": 12}"#;
        let desc = UploadDescriptor::from_json(raw).expect("parse");
        assert_eq!(desc.upload_id, Some(7));
        assert_eq!(desc.redis_key.as_deref(), Some("blob/7"));
        assert_eq!(
            desc.extra.get("flags"),
            Some(&serde_json::Value::from("unit,rust"))
        );

        let bytes = desc.to_json().expect("serialize");
        let back = UploadDescriptor::from_json(&bytes).expect("reparse");
        assert_eq!(back, desc);
    }

    #[test]
    fn descriptor_omits_absent_fields() {
        let desc = UploadDescriptor {
            upload_id: Some(1),
            ..Default::default()
        };
        let json = String::from_utf8(desc.to_json().expect("serialize")).expect("utf8");
        assert!(!json.contains("redis_key"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn task_reply_carries_minimum_shape() {
        let reply = TaskReply::nothing_scheduled(Some("too_many_retries"));
        let json = serde_json::to_value(&reply).expect("serialize");
        assert_eq!(json["successful"], true);
        assert_eq!(json["tasks_were_scheduled"], false);
        assert_eq!(json["reason"], "too_many_retries");
    }
}
