//! The upload processor task.
//!
//! Second task of the pipeline. Receives one chunk of normalised upload
//! descriptors, parses each raw upload into an intermediate report, and
//! records processing state. All processors of one commit serialise on the
//! upload-processing lock, so the master report is never touched while a
//! chunk is in flight.
//!
//! Parser failures are captured on the accumulator without failing the
//! task; a missing raw file gets exactly one grace retry (the ingest tier
//! races its storage write against us) and is then recorded as a permanent
//! upload error. Whatever happens, every upload id this task marked as
//! processing is cleared on the way out so a crash or retry can never leave
//! an id in flight forever.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tributary_lock::{LockError, LockKind};
use tributary_retry::RetrySchedule;
use tributary_state::ProcessingState;
use tributary_types::{
    CommitRef, CommitState, ProcessingErrorInfo, ProcessingResult, ReportType, TaskReply, Upload,
    UploadDescriptor, UploadState,
};

use crate::context::{Services, UploadContext};
use crate::intermediate::IntermediateStore;
use crate::report::ParseError;
use crate::runner::{TaskControl, TaskRequest, TaskResult};
use crate::storage::StorageError;

/// How long a processor waits on the processing lock before surrendering
/// to a scheduled retry.
const LOCK_BLOCKING_WAIT: Duration = Duration::from_secs(5);

/// Deserialised kwargs of one processor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorArgs {
    pub repoid: i64,
    pub commitid: String,
    #[serde(default)]
    pub report_type: ReportType,
    #[serde(default)]
    pub report_code: Option<String>,
    pub commit_yaml: tributary_config::UserConfig,
    pub arguments_list: Vec<UploadDescriptor>,
    #[serde(default)]
    pub in_parallel: bool,
    /// Session id pre-allocated by the dispatcher, parallel mode only.
    #[serde(default)]
    pub parallel_idx: Option<u32>,
    #[serde(default)]
    pub is_final: bool,
}

pub struct UploadProcessorTask {
    services: Arc<Services>,
}

impl UploadProcessorTask {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn run(
        &self,
        args: &ProcessorArgs,
        previous_results: Vec<ProcessingResult>,
        request: &TaskRequest,
    ) -> TaskResult {
        let commit = CommitRef::new(args.repoid, args.commitid.clone());
        let ctx = UploadContext::new(
            Arc::clone(&self.services.kv),
            commit.clone(),
            args.report_type,
            args.report_code.clone(),
        );

        let lock_kind = processing_lock_kind(args.report_type);
        let _guard = match ctx.locks().acquire(lock_kind, LOCK_BLOCKING_WAIT) {
            Ok(guard) => guard,
            Err(LockError::Unavailable { name }) => {
                tracing::warn!(
                    repo_id = commit.repo_id,
                    commit_sha = %commit.commit_sha,
                    lock = %name,
                    retries = request.retries,
                    "unable to acquire processing lock, retrying"
                );
                return Err(TaskControl::retry(
                    &RetrySchedule::processor_lock_contention(),
                    request.retries,
                ));
            }
            Err(e) => return Err(TaskControl::Fatal(e.into())),
        };

        self.process_within_lock(&commit, args, previous_results, request)
    }

    fn process_within_lock(
        &self,
        commit: &CommitRef,
        args: &ProcessorArgs,
        mut processings_so_far: Vec<ProcessingResult>,
        request: &TaskRequest,
    ) -> TaskResult {
        let state = ProcessingState::new(
            Arc::clone(&self.services.kv),
            commit.repo_id,
            commit.commit_sha.clone(),
        );
        let intermediates = IntermediateStore::new(Arc::clone(&self.services.kv));

        let upload_ids: Vec<i64> = args
            .arguments_list
            .iter()
            .filter_map(|d| d.upload_pk.or(d.upload_id))
            .collect();

        // A noop in normal runs; relevant when this task is a retry.
        if let Err(e) = state.mark_uploads_as_processing(&upload_ids) {
            return Err(TaskControl::Fatal(e.into()));
        }

        let outcome = self.process_chunk(
            commit,
            args,
            &state,
            &intermediates,
            &mut processings_so_far,
            request,
        );

        // Success, handled error, or bubbled failure: nothing from this
        // chunk may stay in the processing set.
        if let Err(e) = state.clear_in_progress_uploads(&upload_ids) {
            tracing::error!(
                repo_id = commit.repo_id,
                commit_sha = %commit.commit_sha,
                error = %e,
                "failed to clear in-progress uploads"
            );
        }

        outcome?;
        let n_processed = processings_so_far.iter().filter(|r| r.successful).count();
        tracing::info!(
            repo_id = commit.repo_id,
            commit_sha = %commit.commit_sha,
            n_processed,
            total = processings_so_far.len(),
            "finished processing chunk"
        );
        Ok(TaskReply::Process {
            successful: true,
            processings_so_far,
        })
    }

    fn process_chunk(
        &self,
        commit: &CommitRef,
        args: &ProcessorArgs,
        state: &ProcessingState,
        intermediates: &IntermediateStore,
        processings_so_far: &mut Vec<ProcessingResult>,
        request: &TaskRequest,
    ) -> Result<(), TaskControl> {
        let commit_row = self
            .services
            .metadata
            .fetch_commit(commit)
            .map_err(|e| self.db_error(e, request))?
            .ok_or_else(|| TaskControl::Fatal(anyhow::anyhow!("commit not found in database")))?;

        for descriptor in &args.arguments_list {
            let Some(upload_id) = descriptor.upload_pk.or(descriptor.upload_id) else {
                tracing::warn!(
                    repo_id = commit.repo_id,
                    commit_sha = %commit.commit_sha,
                    "descriptor without an upload id, skipping"
                );
                continue;
            };

            let mut upload = match self
                .services
                .metadata
                .fetch_upload(upload_id)
                .map_err(|e| self.db_error(e, request))?
            {
                Some(upload) => upload,
                None => {
                    tracing::warn!(upload_id, "upload row missing, skipping");
                    continue;
                }
            };
            upload.state = UploadState::Processing;
            self.services
                .metadata
                .update_upload(&upload)
                .map_err(|e| self.db_error(e, request))?;

            let result = self.process_individual_upload(
                commit,
                args,
                state,
                intermediates,
                &mut upload,
                descriptor,
                request,
            );
            match result {
                Ok(result) => processings_so_far.push(result),
                Err(control) => {
                    // Record the commit as errored before bubbling a
                    // non-retry failure, the way a crashed run would be
                    // observed from the outside.
                    if matches!(control, TaskControl::Fatal(_)) {
                        let mut errored = commit_row.clone();
                        errored.state = CommitState::Error;
                        let _ = self.services.metadata.update_commit(&errored);
                    }
                    return Err(control);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_individual_upload(
        &self,
        commit: &CommitRef,
        args: &ProcessorArgs,
        state: &ProcessingState,
        intermediates: &IntermediateStore,
        upload: &mut Upload,
        descriptor: &UploadDescriptor,
        request: &TaskRequest,
    ) -> Result<ProcessingResult, TaskControl> {
        let upload_id = upload.upload_id;
        tracing::info!(
            repo_id = commit.repo_id,
            commit_sha = %commit.commit_sha,
            upload_id,
            in_parallel = args.in_parallel,
            "processing individual upload"
        );

        let storage_path = descriptor
            .storage_path
            .clone()
            .or_else(|| upload.storage_path.clone());
        let Some(storage_path) = storage_path else {
            self.record_upload_error(upload, "no storage path", state)?;
            return Ok(ProcessingResult {
                upload_id,
                successful: false,
                error: Some(ProcessingErrorInfo::FileNotInStorage),
            });
        };

        let raw = match self.services.storage.read(&storage_path) {
            Ok(raw) => raw,
            Err(StorageError::NotFound { .. }) => {
                let grace = RetrySchedule::raw_file_grace();
                if !grace.exhausted(request.retries) {
                    tracing::info!(
                        upload_id,
                        delay_secs = grace.delay(request.retries).as_secs(),
                        "raw upload not in storage yet, scheduling grace retry"
                    );
                    return Err(TaskControl::retry(&grace, request.retries));
                }
                tracing::info!(upload_id, "raw upload never arrived, skipping it");
                self.record_upload_error(upload, "file_not_in_storage", state)?;
                return Ok(ProcessingResult {
                    upload_id,
                    successful: false,
                    error: Some(ProcessingErrorInfo::FileNotInStorage),
                });
            }
            Err(e) => return Err(TaskControl::Fatal(e.into())),
        };

        let report = match self.services.parser.parse(&raw) {
            Ok(report) => report,
            Err(error @ (ParseError::Corrupt(_) | ParseError::Empty)) => {
                self.record_upload_error(upload, &error.to_string(), state)?;
                return Ok(ProcessingResult {
                    upload_id,
                    successful: false,
                    error: Some(ProcessingErrorInfo::ParserError {
                        message: error.to_string(),
                    }),
                });
            }
        };

        intermediates
            .save(upload_id, &report)
            .map_err(TaskControl::Fatal)?;

        upload.state = UploadState::Processed;
        upload.storage_path = Some(storage_path.clone());
        upload.error_reason = None;
        if args.in_parallel {
            upload.order_number = args.parallel_idx;
        }
        self.services
            .metadata
            .update_upload(upload)
            .map_err(|e| self.db_error(e, request))?;

        // Raw uploads are kept by default; deleting is opt-in via config.
        if !args.commit_yaml.archive_uploads() && !storage_path.starts_with("http") {
            if let Err(error) = self.services.storage.delete(&storage_path) {
                tracing::warn!(upload_id, %error, "failed to delete raw upload");
            }
        }

        state
            .mark_upload_as_processed(upload_id)
            .map_err(|e| TaskControl::Fatal(e.into()))?;

        Ok(ProcessingResult {
            upload_id,
            successful: true,
            error: None,
        })
    }

    fn record_upload_error(
        &self,
        upload: &mut Upload,
        reason: &str,
        state: &ProcessingState,
    ) -> Result<(), TaskControl> {
        upload.state = UploadState::Errored;
        upload.error_reason = Some(reason.to_string());
        self.services
            .metadata
            .update_upload(upload)
            .map_err(|e| TaskControl::Fatal(e.into()))?;
        // An errored upload is done; it must not hold up merging.
        state
            .clear_in_progress_uploads(&[upload.upload_id])
            .map_err(|e| TaskControl::Fatal(e.into()))?;
        Ok(())
    }

    fn db_error(&self, error: crate::metadata::MetadataError, request: &TaskRequest) -> TaskControl {
        let schedule = RetrySchedule::db_transient();
        if error.is_transient() && !schedule.exhausted(request.retries) {
            tracing::warn!(%error, retries = request.retries, "transient database error, retrying");
            TaskControl::retry(&schedule, request.retries)
        } else {
            TaskControl::Fatal(error.into())
        }
    }
}

/// The lock that serialises one commit's processing, per pipeline kind.
pub fn processing_lock_kind(report_type: ReportType) -> LockKind {
    match report_type {
        ReportType::BundleAnalysis => LockKind::BundleAnalysisProcessing,
        ReportType::Coverage | ReportType::TestResults => LockKind::UploadProcessing,
    }
}
