//! Per-commit advisory locks on top of the key-value store.
//!
//! Locks are plain KV strings with a TTL, taken with an NX write. The value
//! is a holder token (hostname, pid, nonce) so a guard only ever deletes a
//! lock it still owns; a lock that expired and was re-acquired by another
//! worker is left alone on release.
//!
//! Lock names are derived from `(repo_id, commit_sha, report_type)`. For
//! coverage the report-type suffix is omitted for backward compatibility
//! with keys written by older workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tributary_kv::KeyValueStore;
use tributary_types::ReportType;

/// Default lock TTL; holders must finish or refresh within this window.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// How often a blocked `acquire` re-probes the lock key.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    /// Could not take the lock within the blocking wait. Callers map this
    /// to an explicit task retry with the appropriate backoff schedule.
    #[error("lock {name} is held by another worker")]
    Unavailable { name: String },
    #[error(transparent)]
    Kv(#[from] tributary_kv::KvError),
    #[error("failed to encode holder token: {0}")]
    Token(#[from] serde_json::Error),
}

/// The distinct per-commit locks the pipeline takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Held by the dispatcher while it drains the queue and builds the
    /// task graph.
    Upload,
    /// Serialises processors and the finisher of one commit; every master
    /// report mutation happens under it.
    UploadProcessing,
    Notify,
    ManualTrigger,
    BundleAnalysisProcessing,
    BundleAnalysisNotify,
}

impl LockKind {
    fn as_str(&self) -> &'static str {
        match self {
            LockKind::Upload => "upload",
            LockKind::UploadProcessing => "upload_processing",
            LockKind::Notify => "notify",
            LockKind::ManualTrigger => "manual_trigger",
            LockKind::BundleAnalysisProcessing => "bundle_analysis_processing",
            LockKind::BundleAnalysisNotify => "bundle_analysis_notify",
        }
    }
}

/// Identity of a lock holder, stored as the lock value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderToken {
    pub pid: u32,
    pub hostname: String,
    pub nonce: u64,
    pub acquired_at: DateTime<Utc>,
}

static NONCE: AtomicU64 = AtomicU64::new(0);

impl HolderToken {
    fn mint() -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            nonce: NONCE.fetch_add(1, Ordering::Relaxed),
            acquired_at: Utc::now(),
        }
    }
}

/// Factory for one commit's locks.
pub struct LockManager {
    kv: Arc<dyn KeyValueStore>,
    repo_id: i64,
    commit_sha: String,
    report_type: ReportType,
    lock_timeout: Duration,
}

impl LockManager {
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
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Full KV key for a lock of the given kind.
    pub fn lock_name(&self, kind: LockKind) -> String {
        match (kind, self.report_type) {
            // Manual trigger is commit-wide regardless of report type.
            (LockKind::ManualTrigger, _) => {
                format!("manual_trigger_lock_{}_{}", self.repo_id, self.commit_sha)
            }
            // Coverage keys predate report types and carry no suffix.
            (_, ReportType::Coverage) => {
                format!("{}_lock_{}_{}", kind.as_str(), self.repo_id, self.commit_sha)
            }
            (_, report_type) => format!(
                "{}_lock_{}_{}_{}",
                kind.as_str(),
                self.repo_id,
                self.commit_sha,
                report_type.as_str()
            ),
        }
    }

    /// Whether any worker currently holds the lock.
    pub fn is_locked(&self, kind: LockKind) -> Result<bool, LockError> {
        Ok(self.kv.get(&self.lock_name(kind))?.is_some())
    }

    /// Take the lock, blocking up to `blocking_wait`.
    pub fn acquire(&self, kind: LockKind, blocking_wait: Duration) -> Result<LockGuard, LockError> {
        let name = self.lock_name(kind);
        let token = serde_json::to_vec(&HolderToken::mint())?;
        let deadline = Instant::now() + blocking_wait;

        loop {
            if self.kv.set_nx_ex(&name, &token, self.lock_timeout)? {
                return Ok(LockGuard {
                    kv: Arc::clone(&self.kv),
                    name,
                    token,
                    released: false,
                });
            }
            if Instant::now() >= deadline {
                return Err(LockError::Unavailable { name });
            }
            thread::sleep(ACQUIRE_POLL_INTERVAL.min(blocking_wait));
        }
    }
}

/// Held lock. Releases on drop; release is a no-op once the TTL has expired
/// and someone else holds the key.
pub struct LockGuard {
    kv: Arc<dyn KeyValueStore>,
    name: String,
    token: Vec<u8>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock if we still own it.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.kv.get(&self.name)?.as_deref() == Some(self.token.as_slice()) {
            self.kv.del(&self.name)?;
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Lock name for a pull-synchronisation task, keyed by pull id rather than
/// commit sha.
pub fn pull_sync_lock_name(repo_id: i64, pull_id: i64) -> String {
    format!("pullsync_{}_{}", repo_id, pull_id)
}

#[cfg(test)]
mod tests {
    use tributary_kv::InMemoryKv;

    use super::*;

    fn manager(report_type: ReportType) -> (Arc<InMemoryKv>, LockManager) {
        let kv = Arc::new(InMemoryKv::new());
        let mgr = LockManager::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>, 123, "abcdef0", report_type);
        (kv, mgr)
    }

    #[test]
    fn coverage_lock_names_have_no_suffix() {
        let (_kv, mgr) = manager(ReportType::Coverage);
        assert_eq!(mgr.lock_name(LockKind::Upload), "upload_lock_123_abcdef0");
        assert_eq!(
            mgr.lock_name(LockKind::UploadProcessing),
            "upload_processing_lock_123_abcdef0"
        );
        assert_eq!(mgr.lock_name(LockKind::Notify), "notify_lock_123_abcdef0");
    }

    #[test]
    fn non_coverage_lock_names_carry_the_report_type() {
        let (_kv, mgr) = manager(ReportType::BundleAnalysis);
        assert_eq!(
            mgr.lock_name(LockKind::BundleAnalysisProcessing),
            "bundle_analysis_processing_lock_123_abcdef0_bundle_analysis"
        );
        assert_eq!(
            mgr.lock_name(LockKind::BundleAnalysisNotify),
            "bundle_analysis_notify_lock_123_abcdef0_bundle_analysis"
        );
    }

    #[test]
    fn manual_trigger_lock_never_carries_the_report_type() {
        let (_kv, mgr) = manager(ReportType::TestResults);
        assert_eq!(
            mgr.lock_name(LockKind::ManualTrigger),
            "manual_trigger_lock_123_abcdef0"
        );
    }

    #[test]
    fn acquire_then_release_frees_the_lock() {
        let (_kv, mgr) = manager(ReportType::Coverage);
        let mut guard = mgr.acquire(LockKind::Upload, Duration::ZERO).expect("acquire");
        assert!(mgr.is_locked(LockKind::Upload).expect("is_locked"));
        guard.release().expect("release");
        assert!(!mgr.is_locked(LockKind::Upload).expect("is_locked"));
    }

    #[test]
    fn acquire_fails_fast_under_contention() {
        let (_kv, mgr) = manager(ReportType::Coverage);
        let _held = mgr.acquire(LockKind::Upload, Duration::ZERO).expect("first");
        let err = mgr
            .acquire(LockKind::Upload, Duration::from_millis(50))
            .expect_err("second must fail");
        assert!(matches!(err, LockError::Unavailable { .. }));
    }

    #[test]
    fn drop_releases_the_lock() {
        let (_kv, mgr) = manager(ReportType::Coverage);
        {
            let _guard = mgr.acquire(LockKind::Upload, Duration::ZERO).expect("acquire");
            assert!(mgr.is_locked(LockKind::Upload).expect("is_locked"));
        }
        assert!(!mgr.is_locked(LockKind::Upload).expect("is_locked"));
    }

    #[test]
    fn release_leaves_a_reacquired_lock_alone() {
        let (kv, mgr) = manager(ReportType::Coverage);
        let name = mgr.lock_name(LockKind::Upload);

        let mut guard = mgr.acquire(LockKind::Upload, Duration::ZERO).expect("acquire");
        // Simulate TTL expiry plus takeover by another worker.
        kv.del(&name).expect("del");
        kv.set(&name, b"someone-else").expect("set");

        guard.release().expect("release");
        assert_eq!(kv.get(&name).expect("get"), Some(b"someone-else".to_vec()));
    }

    #[test]
    fn different_kinds_do_not_contend() {
        let (_kv, mgr) = manager(ReportType::Coverage);
        let _upload = mgr.acquire(LockKind::Upload, Duration::ZERO).expect("upload");
        let _processing = mgr
            .acquire(LockKind::UploadProcessing, Duration::ZERO)
            .expect("processing");
    }

    #[test]
    fn pull_sync_name_is_keyed_by_pull() {
        assert_eq!(pull_sync_lock_name(9, 42), "pullsync_9_42");
    }
}
