//! The upload finisher task.
//!
//! Third task of the pipeline. Runs under the same upload-processing lock
//! as the processors, merges intermediate reports into the master report in
//! bounded batches, and decides whether the commit has reached its quiet
//! point — at which moment the notification gate runs and at most one
//! notify task is submitted.
//!
//! The finisher tolerates duplicate invocation end to end: re-merging an
//! already-taken batch is prevented by the state sets, removing merged ids
//! twice is a no-op, deleting deleted intermediates is a no-op, and the
//! master write is idempotent because merging is order-independent.
//!
//! A finisher gathering the parallel shadow fan-out (`in_parallel`) merges
//! into an empty base and writes to the experiment area; it never reaches
//! the notification gate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tributary_checkpoint::{CheckpointLogger, UPLOAD_FLOW};
use tributary_config::UserConfig;
use tributary_lock::{LockError, LockKind, LockManager};
use tributary_retry::RetrySchedule;
use tributary_state::{ProcessingState, should_perform_merge, should_trigger_postprocessing};
use tributary_types::{
    Commit, CommitErrorKind, CommitRef, CommitState, ProcessingResult, ReportType, TaskReply,
    UploadState,
};

use crate::context::{Services, UploadContext};
use crate::gate::{self, GateInputs, ShouldNotify, SkipReason};
use crate::intermediate::IntermediateStore;
use crate::report::Report;
use crate::runner::{Kwargs, TaskControl, TaskRequest, TaskResult, TaskSignature, names};

const LOCK_BLOCKING_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinisherArgs {
    pub repoid: i64,
    pub commitid: String,
    #[serde(default)]
    pub report_type: ReportType,
    #[serde(default)]
    pub report_code: Option<String>,
    pub commit_yaml: UserConfig,
    #[serde(default)]
    pub in_parallel: bool,
}

pub struct UploadFinisherTask {
    services: Arc<Services>,
}

impl UploadFinisherTask {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn run(
        &self,
        args: &FinisherArgs,
        processing_results: Vec<ProcessingResult>,
        kwargs: &mut Kwargs,
        request: &TaskRequest,
    ) -> TaskResult {
        let commit = CommitRef::new(args.repoid, args.commitid.clone());
        tracing::info!(
            repo_id = commit.repo_id,
            commit_sha = %commit.commit_sha,
            in_parallel = args.in_parallel,
            results = processing_results.len(),
            "received upload finisher task"
        );

        let mut checkpoints = if args.report_type == ReportType::Coverage && !args.in_parallel {
            Some(
                CheckpointLogger::from_kwargs(&UPLOAD_FLOW, kwargs)
                    .map_err(|e| TaskControl::Fatal(e.into()))?,
            )
        } else {
            None
        };

        let ctx = UploadContext::new(
            Arc::clone(&self.services.kv),
            commit.clone(),
            args.report_type,
            args.report_code.clone(),
        );

        let _guard = match ctx.locks().acquire(LockKind::UploadProcessing, LOCK_BLOCKING_WAIT) {
            Ok(guard) => guard,
            Err(LockError::Unavailable { name }) => {
                tracing::warn!(lock = %name, "unable to acquire merge lock, retrying");
                return Err(TaskControl::retry(
                    &RetrySchedule::processor_lock_contention(),
                    request.retries,
                ));
            }
            Err(e) => return Err(TaskControl::Fatal(e.into())),
        };

        let outcome = self.finish_within_lock(
            &commit,
            args,
            &ctx,
            processing_results,
            &mut checkpoints,
            kwargs,
            request,
        )?;

        if !args.in_parallel {
            self.invalidate_caches(&commit)?;
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_within_lock(
        &self,
        commit: &CommitRef,
        args: &FinisherArgs,
        ctx: &UploadContext,
        processing_results: Vec<ProcessingResult>,
        checkpoints: &mut Option<CheckpointLogger>,
        kwargs: &mut Kwargs,
        request: &TaskRequest,
    ) -> TaskResult {
        let commit_row = self
            .services
            .metadata
            .fetch_commit(commit)
            .map_err(|e| TaskControl::Fatal(e.into()))?
            .ok_or_else(|| TaskControl::Fatal(anyhow::anyhow!("commit not found in database")))?;

        let state = ProcessingState::new(
            Arc::clone(&self.services.kv),
            commit.repo_id,
            commit.commit_sha.clone(),
        );
        let numbers = state.upload_numbers().map_err(|e| TaskControl::Fatal(e.into()))?;

        if !should_perform_merge(numbers) {
            // More uploads are still being parsed; a later processor's
            // finisher will pick the batch up.
            tracing::info!(
                processing = numbers.processing,
                processed = numbers.processed,
                "not ready to merge yet"
            );
            return Ok(TaskReply::Finish {
                successful: true,
                notifications_called: false,
                reason: Some("not_ready_to_merge".to_string()),
            });
        }

        let mut master_session_count = None;
        let batch: Vec<i64> = state
            .uploads_for_merging()
            .map_err(|e| TaskControl::Fatal(e.into()))?
            .into_iter()
            .collect();
        if !batch.is_empty() {
            let merged = self.merge_batch(commit, args, &batch)?;
            master_session_count = Some(merged);
            state
                .mark_uploads_as_merged(&batch)
                .map_err(|e| TaskControl::Fatal(e.into()))?;
            IntermediateStore::new(Arc::clone(&self.services.kv))
                .delete_many(&batch)
                .map_err(TaskControl::Fatal)?;
            if let Some(checkpoints) = checkpoints.as_mut() {
                let _ = checkpoints.log_opts("BATCH_PROCESSING_COMPLETE", true);
            }
        }

        let numbers = state.upload_numbers().map_err(|e| TaskControl::Fatal(e.into()))?;
        if !should_trigger_postprocessing(numbers) {
            if should_perform_merge(numbers) {
                // Leftover processed uploads and nothing in flight: merge
                // the remainder in a follow-up finisher.
                let mut resubmit_kwargs = kwargs.clone();
                resubmit_kwargs.insert(
                    "processing_results".to_string(),
                    serde_json::to_value(&processing_results)
                        .map_err(|e| TaskControl::Fatal(e.into()))?,
                );
                self.services
                    .runner
                    .submit(TaskSignature::new(names::UPLOAD_FINISHER, resubmit_kwargs))
                    .map_err(TaskControl::Fatal)?;
            }
            return Ok(TaskReply::Finish {
                successful: true,
                notifications_called: false,
                reason: Some("more_uploads_in_flight".to_string()),
            });
        }

        if args.in_parallel {
            // The shadow branch is reconciled offline and never notifies.
            return Ok(TaskReply::Finish {
                successful: true,
                notifications_called: false,
                reason: Some("parallel_shadow".to_string()),
            });
        }

        if let Some(checkpoints) = checkpoints.as_mut() {
            let _ = checkpoints.log_opts("PROCESSING_COMPLETE", true);
        }

        if request.retries == 0 {
            let mut pending_kwargs = ctx.base_kwargs();
            pending_kwargs.insert("branch".to_string(), commit_row.branch.clone().into());
            pending_kwargs.insert(
                "on_a_pull_request".to_string(),
                commit_row.pull_id.is_some().into(),
            );
            self.services
                .runner
                .submit(TaskSignature::new(names::STATUS_SET_PENDING, pending_kwargs))
                .map_err(TaskControl::Fatal)?;
        }

        let session_count = match master_session_count {
            Some(count) => count,
            None => self
                .services
                .reports
                .load_master(commit, args.report_code.as_deref())
                .map_err(|e| TaskControl::Fatal(e.into()))?
                .map(|master| master.session_count())
                .unwrap_or(0),
        };

        self.postprocess(
            commit,
            args,
            ctx,
            commit_row,
            processing_results,
            session_count,
            checkpoints,
            kwargs,
            request,
        )
    }

    /// Merge one batch of intermediate reports and persist the result.
    /// Returns the merged report's session count.
    fn merge_batch(
        &self,
        commit: &CommitRef,
        args: &FinisherArgs,
        batch: &[i64],
    ) -> Result<u32, TaskControl> {
        let intermediates = IntermediateStore::new(Arc::clone(&self.services.kv))
            .load_many(batch)
            .map_err(TaskControl::Fatal)?;

        let mut master = if args.in_parallel {
            // The shadow merge starts from an empty base; only the fanned
            // out uploads' sessions belong to the experiment artifact.
            Report::new()
        } else {
            self.services
                .reports
                .load_master(commit, args.report_code.as_deref())
                .map_err(|e| TaskControl::Fatal(e.into()))?
                .unwrap_or_default()
        };

        for intermediate in intermediates {
            let upload = self
                .services
                .metadata
                .fetch_upload(intermediate.upload_id)
                .map_err(|e| TaskControl::Fatal(e.into()))?;

            let session_id = upload
                .as_ref()
                .and_then(|u| u.order_number)
                .unwrap_or_else(|| master.next_session_id());
            master
                .merge(intermediate.report.with_session_id(session_id))
                .map_err(|e| TaskControl::Fatal(e.into()))?;

            if let Some(mut upload) = upload {
                upload.state = UploadState::Merged;
                upload.order_number = Some(session_id);
                self.services
                    .metadata
                    .update_upload(&upload)
                    .map_err(|e| TaskControl::Fatal(e.into()))?;
            }
        }

        if !args.in_parallel && args.report_type == ReportType::Coverage {
            // Diff application needs the provider; losing it only loses
            // the diff totals, not the report.
            match self.services.provider.get_commit_diff(commit) {
                Ok(diff) => master.apply_diff(&diff),
                Err(error) => {
                    tracing::warn!(%error, "could not apply diff to report, continuing");
                }
            }
        }

        if args.in_parallel {
            self.services
                .reports
                .save_experiment(commit, args.report_code.as_deref(), "parallel", &master)
                .map_err(|e| TaskControl::Fatal(e.into()))?;
        } else {
            self.services
                .reports
                .save_master(commit, args.report_code.as_deref(), &master)
                .map_err(|e| TaskControl::Fatal(e.into()))?;
        }

        tracing::info!(
            batch = batch.len(),
            sessions = master.session_count(),
            in_parallel = args.in_parallel,
            "merged intermediate reports"
        );
        Ok(master.session_count())
    }

    #[allow(clippy::too_many_arguments)]
    fn postprocess(
        &self,
        commit: &CommitRef,
        args: &FinisherArgs,
        ctx: &UploadContext,
        mut commit_row: Commit,
        processing_results: Vec<ProcessingResult>,
        session_count: u32,
        checkpoints: &mut Option<CheckpointLogger>,
        kwargs: &mut Kwargs,
        request: &TaskRequest,
    ) -> TaskResult {
        let other_pipelines_processing = self.other_pipelines_processing(commit, args.report_type)?;

        let _notify_guard = match ctx.locks().acquire(LockKind::Notify, LOCK_BLOCKING_WAIT) {
            Ok(guard) => guard,
            Err(LockError::Unavailable { .. }) => {
                if let Some(checkpoints) = checkpoints.as_mut() {
                    let _ = checkpoints.log("NOTIF_LOCK_ERROR");
                }
                tracing::info!("another notification is already in flight, not notifying");
                return Ok(TaskReply::Finish {
                    successful: true,
                    notifications_called: false,
                    reason: Some("unobtainable_lock".to_string()),
                });
            }
            Err(e) => return Err(TaskControl::Fatal(e.into())),
        };

        let numbers = ProcessingState::new(
            Arc::clone(&self.services.kv),
            commit.repo_id,
            commit.commit_sha.clone(),
        )
        .upload_numbers()
        .map_err(|e| TaskControl::Fatal(e.into()))?;

        let verdict = gate::evaluate(
            &*self.services.provider,
            &GateInputs {
                commit,
                commit_row: &commit_row,
                config: &args.commit_yaml,
                processing_results: &processing_results,
                upload_numbers: numbers,
                other_pipelines_processing,
                report_code: args.report_code.as_deref(),
                session_count,
                retries: request.retries,
            },
        );

        match verdict {
            ShouldNotify::Notify => {
                self.submit_notify(ctx, args, names::NOTIFY, checkpoints)?;
                commit_row.state = CommitState::Complete;
                commit_row.session_count = session_count;
                self.services
                    .metadata
                    .update_commit(&commit_row)
                    .map_err(|e| TaskControl::Fatal(e.into()))?;
                tracing::info!("scheduled notify task");
                Ok(TaskReply::Finish {
                    successful: true,
                    notifications_called: true,
                    reason: None,
                })
            }
            ShouldNotify::NotifyError { reason } => {
                self.submit_notify(ctx, args, names::NOTIFY_ERROR, checkpoints)?;
                commit_row.state = CommitState::Complete;
                commit_row.session_count = session_count;
                self.services
                    .metadata
                    .update_commit(&commit_row)
                    .map_err(|e| TaskControl::Fatal(e.into()))?;
                tracing::info!(%reason, "scheduled error notification");
                Ok(TaskReply::Finish {
                    successful: true,
                    notifications_called: true,
                    reason: Some(reason),
                })
            }
            ShouldNotify::Wait {
                countdown,
                max_retries,
                reason,
            } => {
                if request.retries >= max_retries {
                    if let Some(checkpoints) = checkpoints.as_mut() {
                        let _ = checkpoints.log("NOTIF_TOO_MANY_RETRIES");
                    }
                    tracing::warn!(%reason, "giving up waiting to notify");
                    return Ok(TaskReply::Finish {
                        successful: true,
                        notifications_called: false,
                        reason: Some("too_many_retries".to_string()),
                    });
                }
                tracing::info!(
                    reason,
                    countdown_secs = countdown.as_secs(),
                    "unable to notify yet, retrying later"
                );
                let mut resubmit = kwargs.clone();
                resubmit.insert(
                    "processing_results".to_string(),
                    serde_json::to_value(&processing_results)
                        .map_err(|e| TaskControl::Fatal(e.into()))?,
                );
                *kwargs = resubmit;
                Err(TaskControl::Retry {
                    countdown,
                    max_retries,
                })
            }
            ShouldNotify::Skip(skip) => {
                self.handle_skip(commit, &mut commit_row, &skip, session_count, checkpoints)?;
                Ok(TaskReply::Finish {
                    successful: true,
                    notifications_called: false,
                    reason: Some(skip.as_str().to_string()),
                })
            }
        }
    }

    fn handle_skip(
        &self,
        commit: &CommitRef,
        commit_row: &mut Commit,
        skip: &SkipReason,
        session_count: u32,
        checkpoints: &mut Option<CheckpointLogger>,
    ) -> Result<(), TaskControl> {
        let checkpoint_event = match skip {
            SkipReason::CiSkipCommit => {
                commit_row.state = CommitState::Skipped;
                commit_row.notified = false;
                "SKIPPING_NOTIFICATION"
            }
            SkipReason::NoValidBot => {
                let _ = self.services.metadata.save_commit_error(
                    commit,
                    CommitErrorKind::RepoBotInvalid,
                    serde_json::json!({}),
                );
                "NOTIF_NO_VALID_INTEGRATION"
            }
            SkipReason::CiClientError => "NOTIF_GIT_CLIENT_ERROR",
            SkipReason::CiServerError => "NOTIF_GIT_SERVICE_ERROR",
            _ => "SKIPPING_NOTIFICATION",
        };

        if !matches!(skip, SkipReason::CiSkipCommit) {
            commit_row.state = CommitState::Complete;
        }
        commit_row.session_count = session_count;
        self.services
            .metadata
            .update_commit(commit_row)
            .map_err(|e| TaskControl::Fatal(e.into()))?;

        if let Some(checkpoints) = checkpoints.as_mut() {
            let _ = checkpoints.log(checkpoint_event);
        }
        tracing::info!(reason = skip.as_str(), "skipping notify task");
        Ok(())
    }

    fn submit_notify(
        &self,
        ctx: &UploadContext,
        args: &FinisherArgs,
        task_name: &str,
        checkpoints: &Option<CheckpointLogger>,
    ) -> Result<(), TaskControl> {
        let mut notify_kwargs = ctx.base_kwargs();
        notify_kwargs.insert(
            "current_yaml".to_string(),
            serde_json::to_value(&args.commit_yaml).map_err(|e| TaskControl::Fatal(e.into()))?,
        );
        if let Some(checkpoints) = checkpoints.as_ref() {
            checkpoints.save_to_kwargs(&mut notify_kwargs);
        }
        self.services
            .runner
            .submit(TaskSignature::new(task_name, notify_kwargs))
            .map_err(TaskControl::Fatal)
    }

    /// Whether another report type's pipeline holds its processing lock
    /// for this commit.
    fn other_pipelines_processing(
        &self,
        commit: &CommitRef,
        own_type: ReportType,
    ) -> Result<bool, TaskControl> {
        for report_type in [
            ReportType::Coverage,
            ReportType::BundleAnalysis,
            ReportType::TestResults,
        ] {
            if report_type == own_type {
                continue;
            }
            let locks = LockManager::new(
                Arc::clone(&self.services.kv),
                commit.repo_id,
                commit.commit_sha.clone(),
                report_type,
            );
            if locks
                .is_locked(crate::processor::processing_lock_kind(report_type))
                .map_err(|e| TaskControl::Fatal(e.into()))?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn invalidate_caches(&self, commit: &CommitRef) -> Result<(), TaskControl> {
        let branch = self
            .services
            .metadata
            .fetch_commit(commit)
            .map_err(|e| TaskControl::Fatal(e.into()))?
            .map(|row| row.branch)
            .unwrap_or_default();
        for key in [
            format!("cache/{}/tree/{}", commit.repo_id, branch),
            format!("cache/{}/tree/{}", commit.repo_id, commit.commit_sha),
        ] {
            self.services
                .kv
                .del(&key)
                .map_err(|e| TaskControl::Fatal(e.into()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::metadata::MetadataStore;
    use tributary_kv::{InMemoryKv, KeyValueStore};
    use tributary_types::UploadDescriptor;

    use super::*;
    use crate::metadata::{InMemoryMetadata, pending_commit};
    use crate::provider::ScriptedProvider;
    use crate::report::{ArchiveReportStore, LineRecordParser, Session};
    use crate::runner::RecordingRunner;
    use crate::storage::InMemoryStorage;

    struct Fixture {
        services: Arc<Services>,
        runner: Arc<RecordingRunner>,
        provider: Arc<ScriptedProvider>,
        metadata: Arc<InMemoryMetadata>,
        kv: Arc<InMemoryKv>,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(InMemoryKv::new());
        let storage = Arc::new(InMemoryStorage::new());
        let metadata = Arc::new(InMemoryMetadata::new());
        metadata.insert_commit(pending_commit(1, "abc", "main", "feat: x"));
        let runner = Arc::new(RecordingRunner::new());
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_ci_status(Some(true));
        let services = Arc::new(Services {
            kv: kv.clone(),
            storage: storage.clone(),
            metadata: metadata.clone(),
            provider: provider.clone(),
            parser: Arc::new(LineRecordParser),
            reports: Arc::new(ArchiveReportStore::new(storage)),
            runner: runner.clone(),
            install_config: tributary_config::UserConfig::default(),
            parallel_processing_repos: HashSet::new(),
        });
        Fixture {
            services,
            runner,
            provider,
            metadata,
            kv,
        }
    }

    fn finisher_args() -> FinisherArgs {
        FinisherArgs {
            repoid: 1,
            commitid: "abc".to_string(),
            report_type: ReportType::Coverage,
            report_code: None,
            commit_yaml: tributary_config::UserConfig::default(),
            in_parallel: false,
        }
    }

    fn state(fixture: &Fixture) -> ProcessingState {
        ProcessingState::new(fixture.kv.clone(), 1, "abc")
    }

    /// Put `ids` into the processed set with stored intermediates, as a
    /// processor run would have left them.
    fn seed_processed(fixture: &Fixture, ids: &[i64]) {
        let st = state(fixture);
        let intermediates = IntermediateStore::new(fixture.kv.clone());
        st.mark_uploads_as_processing(ids).expect("mark");
        for &id in ids {
            let commit = CommitRef::new(1, "abc");
            let descriptor = UploadDescriptor {
                upload_id: Some(id),
                ..UploadDescriptor::default()
            };
            fixture
                .metadata
                .create_upload(&commit, ReportType::Coverage, &descriptor)
                .expect("seed upload");
            let mut report = Report::new();
            report.record_line("src/lib.rs", id as u32, 1);
            report.add_session(0, Session::default());
            intermediates.save(id, &report).expect("save intermediate");
            st.mark_upload_as_processed(id).expect("processed");
        }
    }

    fn successes(ids: &[i64]) -> Vec<ProcessingResult> {
        ids.iter()
            .map(|id| ProcessingResult {
                upload_id: *id,
                successful: true,
                error: None,
            })
            .collect()
    }

    fn run(fixture: &Fixture, args: &FinisherArgs, results: Vec<ProcessingResult>) -> TaskResult {
        UploadFinisherTask::new(Arc::clone(&fixture.services)).run(
            args,
            results,
            &mut Kwargs::new(),
            &TaskRequest::default(),
        )
    }

    fn notify_submissions(fixture: &Fixture) -> usize {
        fixture
            .runner
            .submitted_names()
            .iter()
            .filter(|name| *name == names::NOTIFY)
            .count()
    }

    #[test]
    fn single_upload_merges_and_notifies_once() {
        let fixture = fixture();
        seed_processed(&fixture, &[1]);

        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(notifications_called);
        assert_eq!(notify_submissions(&fixture), 1);

        let master = fixture
            .services
            .reports
            .load_master(&CommitRef::new(1, "abc"), None)
            .expect("load")
            .expect("some");
        assert_eq!(master.session_count(), 1);

        let upload = fixture.metadata.fetch_upload(1).expect("fetch").expect("some");
        assert_eq!(upload.state, UploadState::Merged);

        let numbers = state(&fixture).upload_numbers().expect("numbers");
        assert_eq!((numbers.processing, numbers.processed), (0, 0));
    }

    #[test]
    fn early_exit_while_uploads_are_in_flight() {
        let fixture = fixture();
        seed_processed(&fixture, &[1]);
        // A second upload is still being parsed.
        state(&fixture).mark_uploads_as_processing(&[2]).expect("mark");

        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            reason,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!notifications_called);
        assert_eq!(reason.as_deref(), Some("not_ready_to_merge"));
        // Nothing was merged.
        assert_eq!(state(&fixture).upload_numbers().expect("numbers").processed, 1);
    }

    #[test]
    fn batch_merge_is_bounded_and_resubmits_for_the_remainder() {
        let fixture = fixture();
        seed_processed(&fixture, &(1..=8).collect::<Vec<_>>());

        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!notifications_called);

        // Exactly one batch of five was merged, three remain.
        let numbers = state(&fixture).upload_numbers().expect("numbers");
        assert_eq!(numbers.processed, 3);
        // A follow-up finisher was scheduled for the remainder.
        let followups = fixture
            .runner
            .submitted_names()
            .iter()
            .filter(|n| *n == names::UPLOAD_FINISHER)
            .count();
        assert_eq!(followups, 1);
        assert_eq!(notify_submissions(&fixture), 0);
    }

    #[test]
    fn expired_intermediate_still_merges_and_notifies() {
        let fixture = fixture();
        seed_processed(&fixture, &[1]);
        // The intermediate expired before the finisher ran.
        fixture
            .kv
            .del(&crate::intermediate::intermediate_report_key(1))
            .expect("expire");

        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(notifications_called);
        assert_eq!(notify_submissions(&fixture), 1);
    }

    #[test]
    fn ci_skip_commit_never_notifies() {
        let fixture = fixture();
        fixture
            .metadata
            .insert_commit(pending_commit(1, "abc", "main", "hotfix [ci skip]"));
        seed_processed(&fixture, &[1]);

        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!notifications_called);
        assert_eq!(notify_submissions(&fixture), 0);

        let commit = fixture
            .metadata
            .fetch_commit(&CommitRef::new(1, "abc"))
            .expect("fetch")
            .expect("some");
        assert_eq!(commit.state, CommitState::Skipped);
        assert!(!commit.notified);
    }

    #[test]
    fn wait_for_ci_schedules_a_bounded_retry() {
        let fixture = fixture();
        fixture.provider.set_ci_status(None);
        seed_processed(&fixture, &[1]);

        let control = run(&fixture, &finisher_args(), successes(&[1])).expect_err("must wait");
        let TaskControl::Retry {
            countdown,
            max_retries,
        } = control
        else {
            panic!("expected retry");
        };
        assert_eq!(countdown, Duration::from_secs(15));
        assert_eq!(max_retries, 10);
        assert_eq!(notify_submissions(&fixture), 0);
    }

    #[test]
    fn wait_for_ci_gives_up_after_max_retries() {
        let fixture = fixture();
        fixture.provider.set_ci_status(None);
        seed_processed(&fixture, &[1]);

        let reply = UploadFinisherTask::new(Arc::clone(&fixture.services))
            .run(
                &finisher_args(),
                successes(&[1]),
                &mut Kwargs::new(),
                &TaskRequest { retries: 10 },
            )
            .expect("gives up");
        let TaskReply::Finish {
            notifications_called,
            reason,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!notifications_called);
        assert_eq!(reason.as_deref(), Some("too_many_retries"));
    }

    #[test]
    fn failed_ci_submits_an_error_notification() {
        let fixture = fixture();
        fixture.provider.set_ci_status(Some(false));
        seed_processed(&fixture, &[1]);

        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(notifications_called);
        assert!(fixture
            .runner
            .submitted_names()
            .contains(&names::NOTIFY_ERROR.to_string()));
        assert_eq!(notify_submissions(&fixture), 0);
    }

    #[test]
    fn other_pipeline_holding_its_lock_blocks_notification() {
        let fixture = fixture();
        seed_processed(&fixture, &[1]);
        fixture
            .kv
            .set(
                "upload_processing_lock_1_abc_test_results",
                b"other pipeline",
            )
            .expect("seed lock");

        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            reason,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!notifications_called);
        assert_eq!(reason.as_deref(), Some("has_other_notifications_coming"));
    }

    #[test]
    fn merged_sessions_get_distinct_ids() {
        let fixture = fixture();
        seed_processed(&fixture, &[1, 2, 3]);

        run(&fixture, &finisher_args(), successes(&[1, 2, 3])).expect("run");

        let master = fixture
            .services
            .reports
            .load_master(&CommitRef::new(1, "abc"), None)
            .expect("load")
            .expect("some");
        assert_eq!(master.session_count(), 3);
        assert_eq!(master.session_ids().len(), 3);
    }

    #[test]
    fn parallel_finisher_writes_the_experiment_and_stays_quiet() {
        let fixture = fixture();
        seed_processed(&fixture, &[1]);
        // Stamp the pre-allocated session id the dispatcher would have set.
        let mut upload = fixture.metadata.fetch_upload(1).expect("fetch").expect("some");
        upload.order_number = Some(4);
        fixture.metadata.update_upload(&upload).expect("update");

        let mut args = finisher_args();
        args.in_parallel = true;
        let reply = run(&fixture, &args, successes(&[1])).expect("run");
        let TaskReply::Finish {
            notifications_called,
            reason,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!notifications_called);
        assert_eq!(reason.as_deref(), Some("parallel_shadow"));
        assert_eq!(notify_submissions(&fixture), 0);
        // The authoritative master is untouched.
        assert!(fixture
            .services
            .reports
            .load_master(&CommitRef::new(1, "abc"), None)
            .expect("load")
            .is_none());
    }

    #[test]
    fn finisher_invalidates_branch_caches() {
        let fixture = fixture();
        seed_processed(&fixture, &[1]);
        fixture.kv.set("cache/1/tree/main", b"cached").expect("seed");
        fixture.kv.set("cache/1/tree/abc", b"cached").expect("seed");

        run(&fixture, &finisher_args(), successes(&[1])).expect("run");

        assert!(!fixture.kv.exists("cache/1/tree/main").expect("exists"));
        assert!(!fixture.kv.exists("cache/1/tree/abc").expect("exists"));
    }

    #[test]
    fn duplicate_finisher_run_is_harmless() {
        let fixture = fixture();
        seed_processed(&fixture, &[1]);

        run(&fixture, &finisher_args(), successes(&[1])).expect("first");
        let master_before = fixture
            .services
            .reports
            .load_master(&CommitRef::new(1, "abc"), None)
            .expect("load")
            .expect("some");

        // A duplicate delivery of the same finisher.
        let reply = run(&fixture, &finisher_args(), successes(&[1])).expect("second");
        let TaskReply::Finish { .. } = reply else {
            panic!("wrong reply shape");
        };

        let master_after = fixture
            .services
            .reports
            .load_master(&CommitRef::new(1, "abc"), None)
            .expect("load")
            .expect("some");
        assert_eq!(master_before, master_after);
    }
}
