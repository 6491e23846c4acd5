//! The upload task: per-commit entry point of the pipeline.
//!
//! One dispatcher runs per `(repo, sha, report_type)` whenever new uploads
//! arrive. It does the work that happens once per commit rather than once
//! per upload — refreshing commit metadata, installing webhooks, fetching
//! per-commit config, initialising the master report — then drains the
//! argument queue, normalises every descriptor, and schedules the
//! processing task graph:
//!
//! - **coverage**: chunks of three descriptors as a sequential chain of
//!   processors ending in one finisher. Repos enrolled in the shadow
//!   experiment additionally get a parallel fan-out with pre-allocated
//!   session ids, gathered by a finisher that never notifies.
//! - **bundle analysis**: one processor per descriptor, chained, ending in
//!   a notify task.
//! - **test results**: a fan-out of chunked processors gathered by one
//!   finisher.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tributary_checkpoint::{CheckpointLogger, TEST_RESULTS_FLOW, UPLOAD_FLOW};
use tributary_config::UserConfig;
use tributary_lock::{LockError, LockGuard, LockKind};
use tributary_retry::RetrySchedule;
use tributary_types::{
    Commit, CommitErrorKind, CommitRef, ReportType, TaskReply, UploadDescriptor,
};

use crate::context::{Services, UploadContext};
use crate::provider::ProviderError;
use crate::report::ReportStoreError;
use crate::runner::{Kwargs, TaskControl, TaskRequest, TaskResult, TaskSignature, names};
use crate::session::SessionAllocator;

/// Coverage and test-results descriptors are processed in chunks this big.
pub const CHUNK_SIZE: usize = 3;

/// How long the dispatcher waits for the upload lock before scheduling a
/// retry.
const LOCK_BLOCKING_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTaskArgs {
    pub repoid: i64,
    pub commitid: String,
    #[serde(default)]
    pub report_type: ReportType,
    #[serde(default)]
    pub report_code: Option<String>,
}

pub struct UploadTask {
    services: Arc<Services>,
}

impl UploadTask {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn run(&self, args: &UploadTaskArgs, kwargs: &mut Kwargs, request: &TaskRequest) -> TaskResult {
        let mut checkpoints = self.begin_checkpoints(args.report_type, kwargs)?;

        let ctx = UploadContext::new(
            Arc::clone(&self.services.kv),
            CommitRef::new(args.repoid, args.commitid.clone()),
            args.report_type,
            args.report_code.clone(),
        );
        tracing::info!(
            repo_id = args.repoid,
            commit_sha = %args.commitid,
            report_type = %args.report_type,
            "received upload task"
        );

        // A dispatcher racing an active processing chain reschedules once
        // and lets the chain drain.
        if ctx.is_currently_processing().map_err(TaskControl::Fatal)?
            && request.retries == 0
        {
            tracing::info!(
                repo_id = args.repoid,
                commit_sha = %args.commitid,
                "currently processing uploads, retrying in 60s"
            );
            checkpoints_into(&checkpoints, kwargs);
            return Err(TaskControl::retry(
                &RetrySchedule::dispatcher_already_processing(),
                request.retries,
            ));
        }

        let guard = match ctx.locks().acquire(LockKind::Upload, LOCK_BLOCKING_WAIT) {
            Ok(guard) => guard,
            Err(LockError::Unavailable { name }) => {
                tracing::warn!(lock = %name, "unable to acquire upload lock");
                if !ctx.has_pending_jobs().map_err(TaskControl::Fatal)? {
                    if let Some(checkpoints) = checkpoints.as_mut() {
                        let _ = checkpoints.log("NO_PENDING_JOBS");
                    }
                    return Ok(TaskReply::nothing_scheduled(None));
                }
                if request.retries > 1 {
                    if let Some(checkpoints) = checkpoints.as_mut() {
                        let _ = checkpoints.log("TOO_MANY_RETRIES");
                    }
                    return Ok(TaskReply::nothing_scheduled(Some("too_many_retries")));
                }
                checkpoints_into(&checkpoints, kwargs);
                return Err(TaskControl::retry(
                    &RetrySchedule::dispatcher_lock_contention(),
                    request.retries,
                ));
            }
            Err(e) => return Err(TaskControl::Fatal(e.into())),
        };

        self.run_within_lock(args, &ctx, guard, &mut checkpoints, kwargs, request)
    }

    fn begin_checkpoints(
        &self,
        report_type: ReportType,
        kwargs: &mut Kwargs,
    ) -> Result<Option<CheckpointLogger>, TaskControl> {
        let flow = match report_type {
            ReportType::Coverage => &UPLOAD_FLOW,
            ReportType::TestResults => &TEST_RESULTS_FLOW,
            ReportType::BundleAnalysis => return Ok(None),
        };
        let mut checkpoints =
            CheckpointLogger::from_kwargs(flow, kwargs).map_err(|e| TaskControl::Fatal(e.into()))?;
        // A retried task re-logs its begin event.
        checkpoints
            .log_opts(flow.start_event(), true)
            .map_err(|e| TaskControl::Fatal(e.into()))?;
        checkpoints.save_to_kwargs(kwargs);
        Ok(Some(checkpoints))
    }

    fn run_within_lock(
        &self,
        args: &UploadTaskArgs,
        ctx: &UploadContext,
        _guard: LockGuard,
        checkpoints: &mut Option<CheckpointLogger>,
        kwargs: &mut Kwargs,
        request: &TaskRequest,
    ) -> TaskResult {
        if !ctx.has_pending_jobs().map_err(TaskControl::Fatal)? {
            tracing::info!("no pending jobs, upload task is done");
            return Ok(TaskReply::nothing_scheduled(None));
        }

        if let Some(countdown) = ctx
            .should_debounce(&self.services.install_config)
            .map_err(TaskControl::Fatal)?
        {
            tracing::info!(
                countdown_secs = countdown.as_secs(),
                "retrying due to very recent uploads"
            );
            checkpoints_into(checkpoints, kwargs);
            return Err(TaskControl::retry_after(countdown));
        }

        if let Some(checkpoints) = checkpoints.as_mut()
            && args.report_type == ReportType::Coverage
        {
            let _ = checkpoints.log("PROCESSING_BEGIN");
        }

        let commit = &ctx.commit;
        let Some(mut commit_row) = self
            .services
            .metadata
            .fetch_commit(commit)
            .map_err(|e| TaskControl::Fatal(e.into()))?
        else {
            // The ingest tier creates commit rows; the pipeline never does.
            return Err(TaskControl::Fatal(anyhow::anyhow!(
                "commit not found in database"
            )));
        };

        let (was_updated, was_setup) = match self.refresh_from_provider(commit, &mut commit_row) {
            Ok(result) => result,
            Err(control) => {
                checkpoints_into(checkpoints, kwargs);
                return Err(control);
            }
        };

        let commit_config = self.fetch_commit_config(commit);
        let config = UserConfig::final_config(
            Some(&self.services.install_config),
            None,
            commit_config.as_ref(),
        );

        tracing::info!("initializing and saving report");
        match self
            .services
            .reports
            .initialize_master(commit, ctx.report_code.as_deref())
        {
            Ok(()) => {}
            Err(ReportStoreError::NotReady) => {
                tracing::warn!("commit not ready to build its report, retrying in 60s");
                checkpoints_into(checkpoints, kwargs);
                return Err(TaskControl::retry(
                    &RetrySchedule::report_not_ready(),
                    request.retries,
                ));
            }
            Err(e) => return Err(TaskControl::Fatal(e.into())),
        }

        let argument_list = self.collect_arguments(ctx)?;
        if argument_list.is_empty() {
            if let Some(checkpoints) = checkpoints.as_mut()
                && args.report_type == ReportType::Coverage
            {
                let _ = checkpoints.log("INITIAL_PROCESSING_COMPLETE");
                let _ = checkpoints.log("NO_REPORTS_FOUND");
            }
            tracing::info!("no arguments found on the queue, not scheduling tasks");
            return Ok(TaskReply::Dispatch {
                successful: true,
                was_setup,
                was_updated,
                tasks_were_scheduled: false,
                reason: Some("no_reports_found".to_string()),
            });
        }

        self.schedule_tasks(args, ctx, &config, argument_list, checkpoints)?;
        Ok(TaskReply::Dispatch {
            successful: true,
            was_setup,
            was_updated,
            tasks_were_scheduled: true,
            reason: None,
        })
    }

    /// Best-effort refresh of commit metadata and webhook setup. Provider
    /// failures degrade the pipeline instead of stopping it, except rate
    /// limits, which reschedule the whole task.
    fn refresh_from_provider(
        &self,
        commit: &CommitRef,
        commit_row: &mut Commit,
    ) -> Result<(bool, bool), TaskControl> {
        let mut was_updated = false;
        let mut was_setup = false;

        match self.services.provider.fetch_commit_info(commit) {
            Ok(Some(info)) => {
                commit_row.branch = info.branch;
                commit_row.message = info.message;
                commit_row.pull_id = info.pull_id;
                was_updated = true;
            }
            Ok(None) => {}
            Err(ProviderError::NoValidBot) => {
                let _ = self.services.metadata.save_commit_error(
                    commit,
                    CommitErrorKind::RepoBotInvalid,
                    serde_json::json!({"repoid": commit.repo_id}),
                );
                tracing::warn!("repo has no valid bot, continuing without provider data");
            }
            Err(ProviderError::RateLimited) => {
                tracing::warn!("provider apps rate limited, retrying later");
                return Err(TaskControl::Retry {
                    countdown: tributary_retry::rate_limit_countdown(),
                    max_retries: RetrySchedule::notifier_rate_limited().max_retries,
                });
            }
            Err(error) => {
                tracing::warn!(%error, "unable to refresh commit from provider");
            }
        }

        if !commit_row.has_webhook {
            match self.services.provider.create_webhook(commit.repo_id) {
                Ok(hook_id) => {
                    tracing::info!(%hook_id, "registered webhook");
                    commit_row.has_webhook = true;
                    was_setup = true;
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to create webhook");
                }
            }
        }

        self.services
            .metadata
            .update_commit(commit_row)
            .map_err(|e| TaskControl::Fatal(e.into()))?;
        Ok((was_updated, was_setup))
    }

    /// Fetch the per-commit config layer; unusable config degrades to the
    /// repo/owner layers.
    fn fetch_commit_config(&self, commit: &CommitRef) -> Option<UserConfig> {
        let source = match self.services.provider.fetch_commit_config(commit) {
            Ok(Some(source)) => source,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(%error, "unable to fetch commit config from provider");
                return None;
            }
        };
        match UserConfig::from_yaml(&source) {
            Ok(config) => Some(config),
            Err(error) => {
                let _ = self.services.metadata.save_commit_error(
                    commit,
                    CommitErrorKind::InvalidYaml,
                    serde_json::json!({"error": error.to_string()}),
                );
                tracing::warn!(%error, "commit config is invalid, falling back");
                None
            }
        }
    }

    /// Drain and normalise the queue, creating or fetching upload rows and
    /// stamping each descriptor with its primary key.
    fn collect_arguments(&self, ctx: &UploadContext) -> Result<Vec<UploadDescriptor>, TaskControl> {
        let mut argument_list = Vec::new();
        for descriptor in ctx.arguments_list().map_err(TaskControl::Fatal)? {
            let mut normalized = match ctx.normalize_arguments(&*self.services.storage, descriptor)
            {
                Ok(normalized) => normalized,
                Err(error) => {
                    tracing::warn!(%error, "failed to normalise upload descriptor, skipping");
                    continue;
                }
            };

            let upload = match normalized.upload_id {
                Some(upload_id) => self
                    .services
                    .metadata
                    .fetch_upload(upload_id)
                    .map_err(|e| TaskControl::Fatal(e.into()))?,
                None => None,
            };
            let upload = match upload {
                Some(mut upload) => {
                    if upload.storage_path.is_none() {
                        upload.storage_path = normalized.storage_path.clone();
                        self.services
                            .metadata
                            .update_upload(&upload)
                            .map_err(|e| TaskControl::Fatal(e.into()))?;
                    }
                    upload
                }
                None => self
                    .services
                    .metadata
                    .create_upload(&ctx.commit, ctx.report_type, &normalized)
                    .map_err(|e| TaskControl::Fatal(e.into()))?,
            };

            normalized.upload_pk = Some(upload.upload_id);
            if normalized.upload_id.is_none() {
                normalized.upload_id = Some(upload.upload_id);
            }
            argument_list.push(normalized);
        }
        Ok(argument_list)
    }

    fn schedule_tasks(
        &self,
        args: &UploadTaskArgs,
        ctx: &UploadContext,
        config: &UserConfig,
        argument_list: Vec<UploadDescriptor>,
        checkpoints: &mut Option<CheckpointLogger>,
    ) -> Result<(), TaskControl> {
        if let Some(checkpoints) = checkpoints.as_mut()
            && args.report_type == ReportType::Coverage
        {
            let _ = checkpoints.log("INITIAL_PROCESSING_COMPLETE");
        }

        tracing::info!(
            uploads = argument_list.len(),
            report_type = %args.report_type,
            "scheduling processing tasks"
        );

        // Merge-batching pipelines count these uploads as in flight from
        // the moment the graph is committed, so a finisher running between
        // two processors knows more work is coming.
        if matches!(
            args.report_type,
            ReportType::Coverage | ReportType::TestResults
        ) {
            let upload_ids: Vec<i64> = argument_list
                .iter()
                .filter_map(|d| d.upload_pk)
                .collect();
            tributary_state::ProcessingState::new(
                Arc::clone(&self.services.kv),
                ctx.commit.repo_id,
                ctx.commit.commit_sha.clone(),
            )
            .mark_uploads_as_processing(&upload_ids)
            .map_err(|e| TaskControl::Fatal(e.into()))?;
        }

        match args.report_type {
            ReportType::Coverage => {
                self.schedule_coverage(ctx, config, argument_list, checkpoints)
            }
            ReportType::BundleAnalysis => self.schedule_bundle_analysis(ctx, config, argument_list),
            ReportType::TestResults => {
                self.schedule_test_results(ctx, config, argument_list, checkpoints)
            }
        }
    }

    fn schedule_coverage(
        &self,
        ctx: &UploadContext,
        config: &UserConfig,
        argument_list: Vec<UploadDescriptor>,
        checkpoints: &mut Option<CheckpointLogger>,
    ) -> Result<(), TaskControl> {
        let mut tasks: Vec<TaskSignature> = Vec::new();
        let chunk_count = argument_list.len().div_ceil(CHUNK_SIZE);
        for (index, chunk) in argument_list.chunks(CHUNK_SIZE).enumerate() {
            let mut kwargs = ctx.base_kwargs();
            insert_config(&mut kwargs, config)?;
            insert_descriptors(&mut kwargs, chunk)?;
            kwargs.insert("in_parallel".to_string(), false.into());
            kwargs.insert("is_final".to_string(), (index + 1 == chunk_count).into());
            tasks.push(TaskSignature::new(names::UPLOAD_PROCESSOR, kwargs));
        }

        let mut finisher_kwargs = ctx.base_kwargs();
        insert_config(&mut finisher_kwargs, config)?;
        finisher_kwargs.insert("in_parallel".to_string(), false.into());
        if let Some(checkpoints) = checkpoints.as_ref() {
            checkpoints.save_to_kwargs(&mut finisher_kwargs);
        }
        tasks.push(TaskSignature::new(names::UPLOAD_FINISHER, finisher_kwargs));

        self.services
            .runner
            .chain(tasks)
            .map_err(TaskControl::Fatal)?;

        if self
            .services
            .parallel_processing_repos
            .contains(&ctx.commit.repo_id)
        {
            self.schedule_parallel_shadow(ctx, config, &argument_list, checkpoints)?;
        }
        Ok(())
    }

    /// The parallel shadow experiment: the same uploads fanned out one per
    /// task with pre-allocated session ids, gathered by a finisher that
    /// writes to the experiment area and never notifies. The serial chain
    /// remains authoritative.
    fn schedule_parallel_shadow(
        &self,
        ctx: &UploadContext,
        config: &UserConfig,
        argument_list: &[UploadDescriptor],
        checkpoints: &mut Option<CheckpointLogger>,
    ) -> Result<(), TaskControl> {
        let master = self
            .services
            .reports
            .load_master(&ctx.commit, ctx.report_code.as_deref())
            .map_err(|e| TaskControl::Fatal(e.into()))?
            .unwrap_or_default();
        let session_ids = SessionAllocator::new(Arc::clone(&self.services.kv))
            .allocate_parallel_ids(&ctx.commit, &master, argument_list.len())
            .map_err(TaskControl::Fatal)?;

        tracing::info!(
            session_ids = ?session_ids,
            "allocated session ids for parallel upload processing"
        );

        let mut group = Vec::with_capacity(argument_list.len());
        let last = argument_list.len().saturating_sub(1);
        for (index, (descriptor, session_id)) in
            argument_list.iter().zip(session_ids.iter()).enumerate()
        {
            let mut kwargs = ctx.base_kwargs();
            insert_config(&mut kwargs, config)?;
            insert_descriptors(&mut kwargs, std::slice::from_ref(descriptor))?;
            kwargs.insert("in_parallel".to_string(), true.into());
            kwargs.insert("parallel_idx".to_string(), (*session_id).into());
            kwargs.insert("is_final".to_string(), (index == last).into());
            group.push(TaskSignature::new(names::UPLOAD_PROCESSOR, kwargs));
        }

        let mut body_kwargs = ctx.base_kwargs();
        insert_config(&mut body_kwargs, config)?;
        body_kwargs.insert("in_parallel".to_string(), true.into());
        if let Some(checkpoints) = checkpoints.as_ref() {
            checkpoints.save_to_kwargs(&mut body_kwargs);
        }
        let body = TaskSignature::new(names::UPLOAD_FINISHER, body_kwargs);

        self.services
            .runner
            .chord(group, body)
            .map_err(TaskControl::Fatal)
    }

    fn schedule_bundle_analysis(
        &self,
        ctx: &UploadContext,
        config: &UserConfig,
        argument_list: Vec<UploadDescriptor>,
    ) -> Result<(), TaskControl> {
        let mut tasks = Vec::with_capacity(argument_list.len() + 1);
        for descriptor in &argument_list {
            let mut kwargs = ctx.base_kwargs();
            insert_config(&mut kwargs, config)?;
            insert_descriptors(&mut kwargs, std::slice::from_ref(descriptor))?;
            tasks.push(TaskSignature::new(names::BUNDLE_ANALYSIS_PROCESSOR, kwargs));
        }

        let mut notify_kwargs = ctx.base_kwargs();
        insert_config(&mut notify_kwargs, config)?;
        tasks.push(TaskSignature::new(names::BUNDLE_ANALYSIS_NOTIFY, notify_kwargs));

        self.services.runner.chain(tasks).map_err(TaskControl::Fatal)
    }

    fn schedule_test_results(
        &self,
        ctx: &UploadContext,
        config: &UserConfig,
        argument_list: Vec<UploadDescriptor>,
        checkpoints: &mut Option<CheckpointLogger>,
    ) -> Result<(), TaskControl> {
        let mut group = Vec::new();
        for chunk in argument_list.chunks(CHUNK_SIZE) {
            let mut kwargs = ctx.base_kwargs();
            insert_config(&mut kwargs, config)?;
            insert_descriptors(&mut kwargs, chunk)?;
            group.push(TaskSignature::new(names::TEST_RESULTS_PROCESSOR, kwargs));
        }

        let mut body_kwargs = ctx.base_kwargs();
        insert_config(&mut body_kwargs, config)?;
        if let Some(checkpoints) = checkpoints.as_ref() {
            checkpoints.save_to_kwargs(&mut body_kwargs);
        }
        let body = TaskSignature::new(names::TEST_RESULTS_FINISHER, body_kwargs);

        self.services.runner.chord(group, body).map_err(TaskControl::Fatal)
    }
}

fn insert_config(kwargs: &mut Kwargs, config: &UserConfig) -> Result<(), TaskControl> {
    let value = serde_json::to_value(config)
        .map_err(|e| TaskControl::Fatal(anyhow::anyhow!("failed to encode config: {e}")))?;
    kwargs.insert("commit_yaml".to_string(), value);
    Ok(())
}

fn insert_descriptors(kwargs: &mut Kwargs, chunk: &[UploadDescriptor]) -> Result<(), TaskControl> {
    let value = serde_json::to_value(chunk)
        .map_err(|e| TaskControl::Fatal(anyhow::anyhow!("failed to encode descriptors: {e}")))?;
    kwargs.insert("arguments_list".to_string(), value);
    Ok(())
}

fn checkpoints_into(checkpoints: &Option<CheckpointLogger>, kwargs: &mut Kwargs) {
    if let Some(checkpoints) = checkpoints {
        checkpoints.save_to_kwargs(kwargs);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::metadata::MetadataStore;
    use tributary_kv::{InMemoryKv, KeyValueStore};
    use tributary_state::ArgumentQueue;

    use super::*;
    use crate::metadata::{InMemoryMetadata, pending_commit};
    use crate::provider::{CommitInfo, ScriptedProvider};
    use crate::report::{ArchiveReportStore, LineRecordParser, Report, Session};
    use crate::runner::{RecordingRunner, ScheduledWork};
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
        let services = Arc::new(Services {
            kv: kv.clone(),
            storage: storage.clone(),
            metadata: metadata.clone(),
            provider: provider.clone(),
            parser: Arc::new(LineRecordParser),
            reports: Arc::new(ArchiveReportStore::new(storage)),
            runner: runner.clone(),
            install_config: UserConfig::default(),
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

    fn enqueue(fixture: &Fixture, descriptors: &[serde_json::Value]) {
        let queue = ArgumentQueue::new(fixture.kv.clone(), 1, "abc", ReportType::Coverage);
        for descriptor in descriptors {
            queue
                .enqueue(descriptor.to_string().as_bytes())
                .expect("enqueue");
        }
    }

    fn coverage_args() -> UploadTaskArgs {
        UploadTaskArgs {
            repoid: 1,
            commitid: "abc".to_string(),
            report_type: ReportType::Coverage,
            report_code: None,
        }
    }

    fn run(fixture: &Fixture, args: &UploadTaskArgs) -> TaskResult {
        UploadTask::new(Arc::clone(&fixture.services)).run(
            args,
            &mut Kwargs::new(),
            &TaskRequest::default(),
        )
    }

    #[test]
    fn empty_queue_schedules_nothing() {
        let fixture = fixture();
        let reply = run(&fixture, &coverage_args()).expect("run");
        let TaskReply::Dispatch {
            tasks_were_scheduled,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!tasks_were_scheduled);
        assert!(fixture.runner.scheduled().is_empty());
    }

    #[test]
    fn coverage_uploads_become_a_chunked_chain() {
        let fixture = fixture();
        enqueue(
            &fixture,
            &(1..=7)
                .map(|id| serde_json::json!({"upload_id": id, "storage_path": format!("raw/{id}.txt")}))
                .collect::<Vec<_>>(),
        );

        run(&fixture, &coverage_args()).expect("run");

        let scheduled = fixture.runner.scheduled();
        assert_eq!(scheduled.len(), 1);
        let ScheduledWork::Chain(tasks) = &scheduled[0] else {
            panic!("expected a chain");
        };
        // 7 descriptors in chunks of 3 → 3 processors + 1 finisher.
        assert_eq!(tasks.len(), 4);
        assert!(tasks[..3].iter().all(|t| t.name == names::UPLOAD_PROCESSOR));
        assert_eq!(tasks[3].name, names::UPLOAD_FINISHER);
        // Only the last processor is final.
        assert_eq!(tasks[1].kwargs["is_final"], false);
        assert_eq!(tasks[2].kwargs["is_final"], true);
        // The finisher carries the checkpoint envelope.
        assert!(tasks[3].kwargs.contains_key("checkpoints_UploadFlow"));
    }

    #[test]
    fn scheduled_uploads_are_counted_as_in_flight() {
        let fixture = fixture();
        enqueue(
            &fixture,
            &[
                serde_json::json!({"upload_id": 1, "storage_path": "raw/1.txt"}),
                serde_json::json!({"upload_id": 2, "storage_path": "raw/2.txt"}),
            ],
        );

        run(&fixture, &coverage_args()).expect("run");

        let numbers = tributary_state::ProcessingState::new(fixture.kv.clone(), 1, "abc")
            .upload_numbers()
            .expect("numbers");
        assert_eq!(numbers.processing, 2);
        assert_eq!(numbers.processed, 0);
    }

    #[test]
    fn descriptors_are_stamped_with_upload_rows() {
        let fixture = fixture();
        enqueue(&fixture, &[serde_json::json!({"storage_path": "raw/a.txt"})]);

        run(&fixture, &coverage_args()).expect("run");

        let scheduled = fixture.runner.scheduled();
        let ScheduledWork::Chain(tasks) = &scheduled[0] else {
            panic!("expected a chain");
        };
        let descriptors: Vec<UploadDescriptor> =
            serde_json::from_value(tasks[0].kwargs["arguments_list"].clone()).expect("descriptors");
        let upload_pk = descriptors[0].upload_pk.expect("stamped pk");
        assert!(fixture
            .metadata
            .fetch_upload(upload_pk)
            .expect("fetch")
            .is_some());
    }

    #[test]
    fn inline_blobs_are_rewritten_before_scheduling() {
        let fixture = fixture();
        fixture.kv.set("blob/1", b"src/lib.rs:1:1\n").expect("seed");
        enqueue(
            &fixture,
            &[serde_json::json!({"upload_id": 1, "redis_key": "blob/1", "token": "secret"})],
        );

        run(&fixture, &coverage_args()).expect("run");

        let scheduled = fixture.runner.scheduled();
        let ScheduledWork::Chain(tasks) = &scheduled[0] else {
            panic!("expected a chain");
        };
        let descriptors: Vec<UploadDescriptor> =
            serde_json::from_value(tasks[0].kwargs["arguments_list"].clone()).expect("descriptors");
        assert!(descriptors[0].redis_key.is_none());
        assert!(descriptors[0].token.is_none());
        let path = descriptors[0].storage_path.as_ref().expect("path");
        assert!(fixture.services.storage.exists(path).expect("exists"));
    }

    #[test]
    fn missing_commit_is_fatal() {
        let fixture = fixture();
        enqueue(&fixture, &[serde_json::json!({"upload_id": 1})]);
        let mut args = coverage_args();
        args.commitid = "unknown".to_string();

        let control = run(&fixture, &args).expect_err("must fail");
        assert!(matches!(control, TaskControl::Fatal(_)));
    }

    #[test]
    fn active_processing_defers_the_first_attempt() {
        let fixture = fixture();
        enqueue(&fixture, &[serde_json::json!({"upload_id": 1})]);
        // Another worker's processor holds the processing lock.
        fixture
            .kv
            .set("upload_processing_lock_1_abc", b"other")
            .expect("seed lock");

        let control = run(&fixture, &coverage_args()).expect_err("must retry");
        let TaskControl::Retry { countdown, .. } = control else {
            panic!("expected retry");
        };
        assert_eq!(countdown, Duration::from_secs(60));
    }

    #[test]
    fn contended_upload_lock_with_empty_queue_returns_quietly() {
        let fixture = fixture();
        fixture.kv.set("upload_lock_1_abc", b"other").expect("seed lock");

        let reply = run(&fixture, &coverage_args()).expect("run");
        let TaskReply::Dispatch {
            tasks_were_scheduled,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(!tasks_were_scheduled);
    }

    #[test]
    fn contended_upload_lock_with_pending_jobs_retries_with_backoff() {
        let fixture = fixture();
        enqueue(&fixture, &[serde_json::json!({"upload_id": 1})]);
        fixture.kv.set("upload_lock_1_abc", b"other").expect("seed lock");

        let control = UploadTask::new(Arc::clone(&fixture.services))
            .run(&coverage_args(), &mut Kwargs::new(), &TaskRequest { retries: 1 })
            .expect_err("must retry");
        let TaskControl::Retry { countdown, .. } = control else {
            panic!("expected retry");
        };
        assert_eq!(countdown, Duration::from_secs(40));
    }

    #[test]
    fn contended_upload_lock_gives_up_after_retries() {
        let fixture = fixture();
        enqueue(&fixture, &[serde_json::json!({"upload_id": 1})]);
        fixture.kv.set("upload_lock_1_abc", b"other").expect("seed lock");

        let reply = UploadTask::new(Arc::clone(&fixture.services))
            .run(&coverage_args(), &mut Kwargs::new(), &TaskRequest { retries: 2 })
            .expect("gives up");
        let TaskReply::Dispatch { reason, .. } = reply else {
            panic!("wrong reply shape");
        };
        assert_eq!(reason.as_deref(), Some("too_many_retries"));
    }

    #[test]
    fn recent_uploads_debounce_processing() {
        let mut fixture = fixture();
        let config =
            UserConfig::from_yaml("setup:\n  upload_processing_delay: 120\n").expect("config");
        fixture.services = Arc::new(Services {
            kv: fixture.kv.clone(),
            storage: fixture.services.storage.clone(),
            metadata: fixture.metadata.clone(),
            provider: fixture.provider.clone(),
            parser: Arc::new(LineRecordParser),
            reports: fixture.services.reports.clone(),
            runner: fixture.runner.clone(),
            install_config: config,
            parallel_processing_repos: HashSet::new(),
        });
        enqueue(&fixture, &[serde_json::json!({"upload_id": 1})]);
        let queue = ArgumentQueue::new(fixture.kv.clone(), 1, "abc", ReportType::Coverage);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        queue.record_upload_timestamp(now - 5.0).expect("stamp");

        let control = run(&fixture, &coverage_args()).expect_err("must debounce");
        let TaskControl::Retry { countdown, .. } = control else {
            panic!("expected retry");
        };
        assert!(countdown >= Duration::from_secs(30));
    }

    #[test]
    fn provider_refresh_updates_the_commit_row() {
        let fixture = fixture();
        fixture.provider.set_commit_info(CommitInfo {
            branch: "feature".to_string(),
            message: "wip".to_string(),
            pull_id: Some(9),
        });
        enqueue(&fixture, &[serde_json::json!({"upload_id": 1, "storage_path": "raw/a.txt"})]);

        let reply = run(&fixture, &coverage_args()).expect("run");
        let TaskReply::Dispatch {
            was_updated,
            was_setup,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(was_updated);
        assert!(was_setup);

        let commit = fixture
            .metadata
            .fetch_commit(&CommitRef::new(1, "abc"))
            .expect("fetch")
            .expect("some");
        assert_eq!(commit.branch, "feature");
        assert_eq!(commit.pull_id, Some(9));
        assert!(commit.has_webhook);
    }

    #[test]
    fn provider_bot_failure_records_a_commit_error_and_continues() {
        let fixture = fixture();
        fixture.provider.fail_with(|| ProviderError::NoValidBot);
        enqueue(&fixture, &[serde_json::json!({"upload_id": 1, "storage_path": "raw/a.txt"})]);

        let reply = run(&fixture, &coverage_args()).expect("run");
        let TaskReply::Dispatch {
            tasks_were_scheduled,
            ..
        } = reply
        else {
            panic!("wrong reply shape");
        };
        assert!(tasks_were_scheduled);
        assert_eq!(
            fixture.metadata.commit_error_count(&CommitRef::new(1, "abc")),
            1
        );
    }

    #[test]
    fn bundle_analysis_chains_per_descriptor_with_notify() {
        let fixture = fixture();
        let queue = ArgumentQueue::new(fixture.kv.clone(), 1, "abc", ReportType::BundleAnalysis);
        for id in 1..=2 {
            queue
                .enqueue(
                    serde_json::json!({"upload_id": id, "storage_path": format!("raw/{id}.txt")})
                        .to_string()
                        .as_bytes(),
                )
                .expect("enqueue");
        }

        let mut args = coverage_args();
        args.report_type = ReportType::BundleAnalysis;
        run(&fixture, &args).expect("run");

        let scheduled = fixture.runner.scheduled();
        let ScheduledWork::Chain(tasks) = &scheduled[0] else {
            panic!("expected a chain");
        };
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].name, names::BUNDLE_ANALYSIS_NOTIFY);
    }

    #[test]
    fn test_results_fan_out_into_a_chord() {
        let fixture = fixture();
        let queue = ArgumentQueue::new(fixture.kv.clone(), 1, "abc", ReportType::TestResults);
        for id in 1..=5 {
            queue
                .enqueue(
                    serde_json::json!({"upload_id": id, "storage_path": format!("raw/{id}.txt")})
                        .to_string()
                        .as_bytes(),
                )
                .expect("enqueue");
        }

        let mut args = coverage_args();
        args.report_type = ReportType::TestResults;
        run(&fixture, &args).expect("run");

        let scheduled = fixture.runner.scheduled();
        let ScheduledWork::Chord { group, body } = &scheduled[0] else {
            panic!("expected a chord");
        };
        assert_eq!(group.len(), 2);
        assert_eq!(body.name, names::TEST_RESULTS_FINISHER);
    }

    #[test]
    fn parallel_repos_also_get_the_shadow_chord() {
        let mut fixture = fixture();
        let services = Arc::new(Services {
            kv: fixture.kv.clone(),
            storage: fixture.services.storage.clone(),
            metadata: fixture.metadata.clone(),
            provider: fixture.provider.clone(),
            parser: Arc::new(LineRecordParser),
            reports: fixture.services.reports.clone(),
            runner: fixture.runner.clone(),
            install_config: UserConfig::default(),
            parallel_processing_repos: HashSet::from([1]),
        });
        fixture.services = services;

        // An existing master with two sessions pushes allocation past them.
        let mut master = Report::new();
        master.add_session(0, Session::default());
        master.add_session(1, Session::default());
        fixture
            .services
            .reports
            .save_master(&CommitRef::new(1, "abc"), None, &master)
            .expect("seed master");

        enqueue(
            &fixture,
            &[
                serde_json::json!({"upload_id": 1, "storage_path": "raw/1.txt"}),
                serde_json::json!({"upload_id": 2, "storage_path": "raw/2.txt"}),
            ],
        );

        run(&fixture, &coverage_args()).expect("run");

        let scheduled = fixture.runner.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert!(matches!(scheduled[0], ScheduledWork::Chain(_)));
        let ScheduledWork::Chord { group, body } = &scheduled[1] else {
            panic!("expected shadow chord");
        };
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].kwargs["parallel_idx"], 2);
        assert_eq!(group[1].kwargs["parallel_idx"], 3);
        assert_eq!(body.kwargs["in_parallel"], true);
    }
}
