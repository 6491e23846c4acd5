//! Commit/upload row persistence seam.
//!
//! The relational store is authoritative for commits and uploads; the KV
//! coordination state is derived and can be rebuilt from these rows. The
//! pipeline goes through [`MetadataStore`] so the production database
//! binding stays out of the core. Errors are classified transient or
//! permanent because the retry policy treats them differently.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use tributary_types::{
    Commit, CommitErrorKind, CommitRef, CommitState, ReportType, Upload, UploadDescriptor,
    UploadState,
};

#[derive(Debug, Error)]
pub enum MetadataError {
    /// Deadlocks, dropped connections: retry with backoff.
    #[error("transient database error: {0}")]
    Transient(String),
    #[error("database error: {0}")]
    Permanent(String),
}

impl MetadataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MetadataError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Row persistence for commits and uploads.
pub trait MetadataStore: Send + Sync {
    fn fetch_commit(&self, commit: &CommitRef) -> Result<Option<Commit>>;
    fn update_commit(&self, commit: &Commit) -> Result<()>;

    fn fetch_upload(&self, upload_id: i64) -> Result<Option<Upload>>;
    /// Create an upload row for a descriptor that arrived without one.
    fn create_upload(
        &self,
        commit: &CommitRef,
        report_type: ReportType,
        descriptor: &UploadDescriptor,
    ) -> Result<Upload>;
    fn update_upload(&self, upload: &Upload) -> Result<()>;
    fn uploads_for_commit(&self, commit: &CommitRef) -> Result<Vec<Upload>>;

    /// Record a typed commit error. At most one row per (commit, kind);
    /// repeats are no-ops.
    fn save_commit_error(
        &self,
        commit: &CommitRef,
        kind: CommitErrorKind,
        params: serde_json::Value,
    ) -> Result<()>;
}

#[derive(Default)]
struct Rows {
    commits: HashMap<(i64, String), Commit>,
    uploads: HashMap<i64, Upload>,
    commit_errors: HashSet<(i64, String, CommitErrorKind)>,
    next_upload_id: i64,
}

/// In-memory row store for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryMetadata {
    rows: Mutex<Rows>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Rows {
                next_upload_id: 1,
                ..Rows::default()
            }),
        }
    }

    /// Seed a commit row the way the ingest tier would.
    pub fn insert_commit(&self, commit: Commit) {
        let mut rows = self.rows.lock().expect("metadata mutex poisoned");
        rows.commits
            .insert((commit.repo_id, commit.commit_sha.clone()), commit);
    }

    /// Seed an upload row with a fixed id.
    pub fn insert_upload(&self, upload: Upload) {
        let mut rows = self.rows.lock().expect("metadata mutex poisoned");
        rows.next_upload_id = rows.next_upload_id.max(upload.upload_id + 1);
        rows.uploads.insert(upload.upload_id, upload);
    }

    pub fn commit_error_count(&self, commit: &CommitRef) -> usize {
        let rows = self.rows.lock().expect("metadata mutex poisoned");
        rows.commit_errors
            .iter()
            .filter(|(repo_id, sha, _)| *repo_id == commit.repo_id && *sha == commit.commit_sha)
            .count()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Rows>> {
        self.rows
            .lock()
            .map_err(|e| MetadataError::Permanent(e.to_string()))
    }
}

impl MetadataStore for InMemoryMetadata {
    fn fetch_commit(&self, commit: &CommitRef) -> Result<Option<Commit>> {
        let rows = self.lock()?;
        Ok(rows
            .commits
            .get(&(commit.repo_id, commit.commit_sha.clone()))
            .cloned())
    }

    fn update_commit(&self, commit: &Commit) -> Result<()> {
        let mut rows = self.lock()?;
        rows.commits
            .insert((commit.repo_id, commit.commit_sha.clone()), commit.clone());
        Ok(())
    }

    fn fetch_upload(&self, upload_id: i64) -> Result<Option<Upload>> {
        let rows = self.lock()?;
        Ok(rows.uploads.get(&upload_id).cloned())
    }

    fn create_upload(
        &self,
        commit: &CommitRef,
        report_type: ReportType,
        descriptor: &UploadDescriptor,
    ) -> Result<Upload> {
        let mut rows = self.lock()?;
        let upload_id = descriptor.upload_id.unwrap_or(rows.next_upload_id);
        rows.next_upload_id = rows.next_upload_id.max(upload_id + 1);
        let now = Utc::now();
        let upload = Upload {
            upload_id,
            repo_id: commit.repo_id,
            commit_sha: commit.commit_sha.clone(),
            storage_path: descriptor.storage_path.clone(),
            report_code: None,
            report_type,
            state: UploadState::Queued,
            order_number: None,
            error_reason: None,
            created_at: now,
            updated_at: now,
        };
        rows.uploads.insert(upload_id, upload.clone());
        Ok(upload)
    }

    fn update_upload(&self, upload: &Upload) -> Result<()> {
        let mut rows = self.lock()?;
        let mut updated = upload.clone();
        updated.updated_at = Utc::now();
        rows.uploads.insert(upload.upload_id, updated);
        Ok(())
    }

    fn uploads_for_commit(&self, commit: &CommitRef) -> Result<Vec<Upload>> {
        let rows = self.lock()?;
        let mut uploads: Vec<Upload> = rows
            .uploads
            .values()
            .filter(|u| u.repo_id == commit.repo_id && u.commit_sha == commit.commit_sha)
            .cloned()
            .collect();
        uploads.sort_by_key(|u| u.upload_id);
        Ok(uploads)
    }

    fn save_commit_error(
        &self,
        commit: &CommitRef,
        kind: CommitErrorKind,
        params: serde_json::Value,
    ) -> Result<()> {
        let mut rows = self.lock()?;
        let key = (commit.repo_id, commit.commit_sha.clone(), kind);
        if rows.commit_errors.insert(key) {
            tracing::warn!(
                repo_id = commit.repo_id,
                commit_sha = %commit.commit_sha,
                ?kind,
                %params,
                "recorded commit error"
            );
        }
        Ok(())
    }
}

/// A pending commit row as the ingest tier would create it.
pub fn pending_commit(repo_id: i64, commit_sha: &str, branch: &str, message: &str) -> Commit {
    Commit {
        repo_id,
        commit_sha: commit_sha.to_string(),
        branch: branch.to_string(),
        pull_id: None,
        message: message.to_string(),
        state: CommitState::Pending,
        notified: false,
        session_count: 0,
        has_webhook: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_commit() -> (InMemoryMetadata, CommitRef) {
        let store = InMemoryMetadata::new();
        store.insert_commit(pending_commit(1, "abc", "main", "feat: x"));
        (store, CommitRef::new(1, "abc"))
    }

    #[test]
    fn fetch_commit_returns_seeded_row() {
        let (store, commit) = store_with_commit();
        let row = store.fetch_commit(&commit).expect("fetch").expect("some");
        assert_eq!(row.branch, "main");
        assert_eq!(row.state, CommitState::Pending);
    }

    #[test]
    fn fetch_commit_returns_none_for_unknown_sha() {
        let (store, _) = store_with_commit();
        assert!(store
            .fetch_commit(&CommitRef::new(1, "other"))
            .expect("fetch")
            .is_none());
    }

    #[test]
    fn create_upload_allocates_increasing_ids() {
        let (store, commit) = store_with_commit();
        let first = store
            .create_upload(&commit, ReportType::Coverage, &UploadDescriptor::default())
            .expect("create");
        let second = store
            .create_upload(&commit, ReportType::Coverage, &UploadDescriptor::default())
            .expect("create");
        assert!(second.upload_id > first.upload_id);
    }

    #[test]
    fn create_upload_honours_descriptor_id() {
        let (store, commit) = store_with_commit();
        let descriptor = UploadDescriptor {
            upload_id: Some(50),
            ..UploadDescriptor::default()
        };
        let upload = store
            .create_upload(&commit, ReportType::Coverage, &descriptor)
            .expect("create");
        assert_eq!(upload.upload_id, 50);

        let next = store
            .create_upload(&commit, ReportType::Coverage, &UploadDescriptor::default())
            .expect("create");
        assert_eq!(next.upload_id, 51);
    }

    #[test]
    fn commit_errors_deduplicate_by_kind() {
        let (store, commit) = store_with_commit();
        store
            .save_commit_error(&commit, CommitErrorKind::RepoBotInvalid, serde_json::json!({}))
            .expect("save");
        store
            .save_commit_error(&commit, CommitErrorKind::RepoBotInvalid, serde_json::json!({}))
            .expect("save again");
        store
            .save_commit_error(&commit, CommitErrorKind::InvalidYaml, serde_json::json!({}))
            .expect("save other");
        assert_eq!(store.commit_error_count(&commit), 2);
    }

    #[test]
    fn uploads_for_commit_filters_and_sorts() {
        let (store, commit) = store_with_commit();
        store.insert_commit(pending_commit(1, "other", "main", "m"));
        for (id, sha) in [(3, "abc"), (1, "abc"), (2, "other")] {
            let descriptor = UploadDescriptor {
                upload_id: Some(id),
                ..UploadDescriptor::default()
            };
            store
                .create_upload(&CommitRef::new(1, sha), ReportType::Coverage, &descriptor)
                .expect("create");
        }
        let uploads = store.uploads_for_commit(&commit).expect("list");
        assert_eq!(
            uploads.iter().map(|u| u.upload_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }
}
