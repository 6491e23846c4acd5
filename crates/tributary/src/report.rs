//! The mergeable report model and its seams.
//!
//! A [`Report`] is the in-memory artifact the pipeline builds: per-file
//! line-hit counts plus one session per merged upload. Merging is
//! associative and commutative as long as session ids are disjoint, which
//! the session allocator guarantees; that is what makes the parallel
//! processing shapes safe.
//!
//! Raw-format parsing stays behind [`ReportParser`]; persistence of the
//! per-commit master report stays behind [`ReportStore`]. The pipeline only
//! relies on the operations defined here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tributary_types::CommitRef;

use crate::provider::CommitDiff;
use crate::storage::ObjectStore;

/// One upload's slice of the master report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    /// Sessions copied from a parent commit's report. Their ids must be
    /// skipped when allocating new ones.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub carried_forward: bool,
}

/// Line-hit counts for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverage {
    lines: BTreeMap<u32, u64>,
}

impl FileCoverage {
    pub fn record(&mut self, line: u32, hits: u64) {
        *self.lines.entry(line).or_insert(0) += hits;
    }

    pub fn hits(&self, line: u32) -> Option<u64> {
        self.lines.get(&line).copied()
    }

    pub fn lines(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.lines.iter().map(|(line, hits)| (*line, *hits))
    }
}

/// Coverage of the lines a commit changed, derived from the provider diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffTotals {
    pub files: usize,
    pub covered: u64,
    pub missed: u64,
}

/// The merged, per-commit artifact. Also used for single-upload partial
/// reports, which carry exactly one session under a provisional id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    files: BTreeMap<String, FileCoverage>,
    sessions: BTreeMap<u32, Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff_totals: Option<DiffTotals>,
}

#[derive(Debug, Error)]
pub enum MergeError {
    /// Both reports carry the same session id; the allocator should have
    /// prevented this.
    #[error("session id {0} exists in both reports")]
    SessionCollision(u32),
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.sessions.is_empty()
    }

    pub fn add_session(&mut self, id: u32, session: Session) {
        self.sessions.insert(id, session);
    }

    pub fn record_line(&mut self, file: &str, line: u32, hits: u64) {
        self.files.entry(file.to_string()).or_default().record(line, hits);
    }

    pub fn file(&self, path: &str) -> Option<&FileCoverage> {
        self.files.get(path)
    }

    pub fn session_count(&self) -> u32 {
        self.sessions.len() as u32
    }

    pub fn session_ids(&self) -> BTreeSet<u32> {
        self.sessions.keys().copied().collect()
    }

    /// The next free session id: one past the highest id in use, including
    /// carried-forward sessions.
    pub fn next_session_id(&self) -> u32 {
        self.sessions.keys().next_back().map_or(0, |max| max + 1)
    }

    /// Renumber a single-session partial report onto its assigned id.
    pub fn with_session_id(mut self, id: u32) -> Self {
        let sessions = std::mem::take(&mut self.sessions);
        self.sessions = sessions
            .into_values()
            .map(|session| (id, session))
            .collect();
        self
    }

    /// Fold `other` into this report. Line hits add; sessions must be
    /// disjoint. The operation is order-independent: any permutation of
    /// merges yields a byte-identical serialised report.
    pub fn merge(&mut self, other: Report) -> Result<(), MergeError> {
        if let Some(id) = other.sessions.keys().find(|id| self.sessions.contains_key(id)) {
            return Err(MergeError::SessionCollision(*id));
        }
        self.sessions.extend(other.sessions);
        for (path, coverage) in other.files {
            let target = self.files.entry(path).or_default();
            for (line, hits) in coverage.lines {
                *target.lines.entry(line).or_insert(0) += hits;
            }
        }
        Ok(())
    }

    /// Apply the commit diff: summarise coverage of the changed lines.
    pub fn apply_diff(&mut self, diff: &CommitDiff) {
        let mut totals = DiffTotals::default();
        for (path, changed_lines) in &diff.files {
            let Some(coverage) = self.files.get(path) else {
                totals.files += 1;
                totals.missed += changed_lines.len() as u64;
                continue;
            };
            totals.files += 1;
            for line in changed_lines {
                match coverage.hits(*line) {
                    Some(hits) if hits > 0 => totals.covered += 1,
                    _ => totals.missed += 1,
                }
            }
        }
        self.diff_totals = Some(totals);
    }

    pub fn diff_totals(&self) -> Option<DiffTotals> {
        self.diff_totals
    }

    /// Split into the two persisted fields: the chunks blob (file
    /// coverage) and the report metadata JSON (sessions, totals).
    pub fn to_parts(&self) -> Result<ReportParts, serde_json::Error> {
        #[derive(Serialize)]
        struct Meta<'a> {
            sessions: &'a BTreeMap<u32, Session>,
            #[serde(skip_serializing_if = "Option::is_none")]
            diff_totals: &'a Option<DiffTotals>,
        }
        Ok(ReportParts {
            chunks: serde_json::to_vec(&self.files)?,
            report_json: serde_json::to_vec(&Meta {
                sessions: &self.sessions,
                diff_totals: &self.diff_totals,
            })?,
        })
    }

    pub fn from_parts(parts: &ReportParts) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Meta {
            sessions: BTreeMap<u32, Session>,
            #[serde(default)]
            diff_totals: Option<DiffTotals>,
        }
        let files = serde_json::from_slice(&parts.chunks)?;
        let meta: Meta = serde_json::from_slice(&parts.report_json)?;
        Ok(Self {
            files,
            sessions: meta.sessions,
            diff_totals: meta.diff_totals,
        })
    }

    /// Serialised size, the quantity bounded by merge batching.
    pub fn size(&self) -> usize {
        self.to_parts()
            .map(|parts| parts.chunks.len() + parts.report_json.len())
            .unwrap_or(0)
    }
}

/// The two persisted fields of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportParts {
    pub chunks: Vec<u8>,
    pub report_json: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unreadable report: {0}")]
    Corrupt(String),
    #[error("report carries no coverage data")]
    Empty,
}

/// Parses one raw upload into a single-session partial report.
pub trait ReportParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<Report, ParseError>;
}

/// Reference parser for the line-record format: one `path:line[:hits]`
/// record per line, `#` comments and blank lines skipped.
#[derive(Debug, Default)]
pub struct LineRecordParser;

impl ReportParser for LineRecordParser {
    fn parse(&self, raw: &[u8]) -> Result<Report, ParseError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| ParseError::Corrupt(format!("not utf-8: {e}")))?;

        let mut report = Report::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.rsplitn(3, ':');
            let parse_err = || ParseError::Corrupt(format!("bad record on line {}", number + 1));
            let last = parts.next().ok_or_else(parse_err)?;
            let middle = parts.next().ok_or_else(parse_err)?;
            let (path, line_no, hits) = match parts.next() {
                Some(path) => (
                    path,
                    middle.parse::<u32>().map_err(|_| parse_err())?,
                    last.parse::<u64>().map_err(|_| parse_err())?,
                ),
                // Two-field form defaults to one hit.
                None => (middle, last.parse::<u32>().map_err(|_| parse_err())?, 1),
            };
            report.record_line(path, line_no, hits);
        }

        if report.is_empty() {
            return Err(ParseError::Empty);
        }
        report.add_session(0, Session::default());
        Ok(report)
    }
}

#[derive(Debug, Error)]
pub enum ReportStoreError {
    /// The commit is not yet in a state where its report can be built
    /// (e.g. its metadata is still being synced). Retryable.
    #[error("commit is not ready to build a report yet")]
    NotReady,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Persistence of the per-commit master report.
pub trait ReportStore: Send + Sync {
    /// Ensure the commit has a (possibly empty) master report.
    fn initialize_master(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
    ) -> Result<(), ReportStoreError>;

    fn load_master(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
    ) -> Result<Option<Report>, ReportStoreError>;

    fn save_master(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
        report: &Report,
    ) -> Result<(), ReportStoreError>;

    /// Write a report into the parallel-experiment area for offline
    /// reconciliation; never read by the pipeline.
    fn save_experiment(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
        label: &str,
        report: &Report,
    ) -> Result<(), ReportStoreError>;
}

/// Master reports persisted as JSON blobs in the object store.
pub struct ArchiveReportStore {
    storage: Arc<dyn ObjectStore>,
}

impl ArchiveReportStore {
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }

    fn master_path(commit: &CommitRef, report_code: Option<&str>) -> String {
        format!(
            "v4/repos/{}/commits/{}/reports/{}.json",
            commit.repo_id,
            commit.commit_sha,
            report_code.unwrap_or("default")
        )
    }

    fn experiment_path(commit: &CommitRef, report_code: Option<&str>, label: &str) -> String {
        format!(
            "v4/repos/{}/commits/{}/parallel-experiment/{}/{}.json",
            commit.repo_id,
            commit.commit_sha,
            report_code.unwrap_or("default"),
            label
        )
    }

    fn write(&self, path: &str, report: &Report) -> Result<(), ReportStoreError> {
        let bytes = serde_json::to_vec(report)
            .map_err(|e| ReportStoreError::Storage(anyhow::anyhow!(e)))?;
        self.storage
            .write(path, &bytes)
            .map_err(|e| ReportStoreError::Storage(anyhow::anyhow!(e)))?;
        Ok(())
    }
}

impl ReportStore for ArchiveReportStore {
    fn initialize_master(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
    ) -> Result<(), ReportStoreError> {
        let path = Self::master_path(commit, report_code);
        let exists = self
            .storage
            .exists(&path)
            .map_err(|e| ReportStoreError::Storage(anyhow::anyhow!(e)))?;
        if !exists {
            self.write(&path, &Report::new())?;
        }
        Ok(())
    }

    fn load_master(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
    ) -> Result<Option<Report>, ReportStoreError> {
        let path = Self::master_path(commit, report_code);
        match self.storage.read(&path) {
            Ok(bytes) => {
                let report = serde_json::from_slice(&bytes)
                    .map_err(|e| ReportStoreError::Storage(anyhow::anyhow!(e)))?;
                Ok(Some(report))
            }
            Err(crate::storage::StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(ReportStoreError::Storage(anyhow::anyhow!(e))),
        }
    }

    fn save_master(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
        report: &Report,
    ) -> Result<(), ReportStoreError> {
        self.write(&Self::master_path(commit, report_code), report)
    }

    fn save_experiment(
        &self,
        commit: &CommitRef,
        report_code: Option<&str>,
        label: &str,
        report: &Report,
    ) -> Result<(), ReportStoreError> {
        self.write(&Self::experiment_path(commit, report_code, label), report)
    }
}
