//! Single-node worker runtime.
//!
//! Plays the role of the broker plus one worker process: the pipeline
//! schedules task graphs into an in-process queue, and the runtime drains
//! them through an explicit dispatch table mapping task names to handlers.
//! Chains pass the accumulator task to task; chords gather their group
//! before the body runs; `Retry` control values are honoured by sleeping
//! out (a capped version of) the countdown and re-invoking the handler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tributary::context::Services;
use tributary::dispatcher::{UploadTask, UploadTaskArgs};
use tributary::finisher::{FinisherArgs, UploadFinisherTask};
use tributary::gate::{Notifier, NotifyKind};
use tributary::processor::{ProcessorArgs, UploadProcessorTask};
use tributary::runner::{
    Kwargs, RecordingRunner, ScheduledWork, TaskControl, TaskRequest, TaskRunner, TaskSignature,
    names, route_task,
};
use tributary_checkpoint::{CheckpointLogger, UPLOAD_FLOW};
use tributary_kv::KeyValueStore;
use tributary_state::ArgumentQueue;
use tributary_types::{CommitRef, ProcessingResult, ReportType, TaskReply};

pub struct WorkerRuntime {
    services: Arc<Services>,
    broker: Arc<RecordingRunner>,
    notifier: Arc<dyn Notifier>,
    user_plan: String,
    /// Single-node runs compress broker countdowns to keep a drain from
    /// stalling for hours on wait-for-CI style schedules.
    retry_sleep_cap: Duration,
}

impl WorkerRuntime {
    pub fn new(
        services: Arc<Services>,
        broker: Arc<RecordingRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            services,
            broker,
            notifier,
            user_plan: "users-basic".to_string(),
            retry_sleep_cap: Duration::from_secs(5),
        }
    }

    pub fn with_user_plan(mut self, user_plan: impl Into<String>) -> Self {
        self.user_plan = user_plan.into();
        self
    }

    pub fn with_retry_sleep_cap(mut self, cap: Duration) -> Self {
        self.retry_sleep_cap = cap;
        self
    }

    /// Seed one upload the way the ingest tier would: raw content into the
    /// object store, a descriptor onto the argument queue, and the
    /// last-upload timestamp for the debounce window.
    pub fn ingest_upload(
        &self,
        commit: &CommitRef,
        report_type: ReportType,
        content: &[u8],
    ) -> Result<String> {
        let report_id = format!("upload-{}", chrono::Utc::now().timestamp_micros());
        let path = tributary::storage::raw_upload_path(
            chrono::Utc::now(),
            &commit.repo_id.to_string(),
            &commit.commit_sha,
            &report_id,
        );
        self.services
            .storage
            .write(&path, content)
            .context("failed to write raw upload")?;

        let queue = ArgumentQueue::new(
            Arc::clone(&self.services.kv),
            commit.repo_id,
            commit.commit_sha.clone(),
            report_type,
        );
        queue
            .enqueue(
                serde_json::json!({"storage_path": path})
                    .to_string()
                    .as_bytes(),
            )
            .context("failed to enqueue upload descriptor")?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        queue
            .record_upload_timestamp(now)
            .context("failed to stamp upload time")?;
        Ok(path)
    }

    /// Kick off the pipeline for one commit.
    pub fn dispatch(&self, commit: &CommitRef, report_type: ReportType) -> Result<()> {
        let mut kwargs = Kwargs::new();
        kwargs.insert("repoid".to_string(), commit.repo_id.into());
        kwargs.insert("commitid".to_string(), commit.commit_sha.clone().into());
        kwargs.insert("report_type".to_string(), report_type.as_str().into());
        self.broker
            .submit(TaskSignature::new(names::UPLOAD, kwargs))
            .context("failed to submit upload task")
    }

    /// Drain the queue until the broker is quiet.
    pub fn drain(&self) -> Result<()> {
        loop {
            let work = self.broker.take_scheduled();
            if work.is_empty() {
                return Ok(());
            }
            for item in work {
                self.execute_work(item)?;
            }
        }
    }

    fn execute_work(&self, work: ScheduledWork) -> Result<()> {
        match work {
            ScheduledWork::Single(task) => {
                self.execute_task(&task, Vec::new())?;
            }
            ScheduledWork::Chain(tasks) => {
                let mut acc = Vec::new();
                for task in tasks {
                    acc = self.execute_task(&task, acc)?;
                }
            }
            ScheduledWork::Chord { group, body } => {
                let mut acc = Vec::new();
                for task in group {
                    acc.extend(self.execute_task(&task, Vec::new())?);
                }
                self.execute_task(&body, acc)?;
            }
        }
        Ok(())
    }

    /// Run one task through the dispatch table, honouring retry control.
    fn execute_task(
        &self,
        task: &TaskSignature,
        acc: Vec<ProcessingResult>,
    ) -> Result<Vec<ProcessingResult>> {
        let route = route_task(&task.name, &self.user_plan, &self.services.install_config);
        tracing::debug!(
            task = %task.name,
            queue = %route.queue,
            soft_timelimit = ?route.soft_timelimit,
            "executing task"
        );
        if let Some(countdown) = task.countdown {
            std::thread::sleep(countdown.min(self.retry_sleep_cap));
        }

        let mut kwargs = task.kwargs.clone();
        let mut retries = 0u32;
        loop {
            let started = std::time::Instant::now();
            let outcome = self.invoke_handler(&task.name, &mut kwargs, acc.clone(), retries);
            if let Some(hard_limit) = route.hard_timelimit
                && started.elapsed() > hard_limit
            {
                // A brokered deployment would have killed the task; record
                // the overrun on the flow so the latency data is honest.
                tracing::warn!(task = %task.name, "task exceeded its hard time limit");
                if let Ok(mut checkpoints) = CheckpointLogger::from_kwargs(&UPLOAD_FLOW, &kwargs) {
                    let _ = checkpoints.log_opts("CELERY_TIMEOUT", true);
                }
            }
            match outcome {
                Ok(HandlerOutcome::Accumulator(results)) => return Ok(results),
                Ok(HandlerOutcome::Done) => return Ok(acc),
                Err(TaskControl::Retry {
                    countdown,
                    max_retries,
                }) => {
                    retries += 1;
                    if retries >= max_retries {
                        self.log_retry_exhaustion(&kwargs);
                        return Ok(acc);
                    }
                    tracing::info!(
                        task = %task.name,
                        retries,
                        countdown_secs = countdown.as_secs(),
                        "task asked for a retry"
                    );
                    std::thread::sleep(countdown.min(self.retry_sleep_cap));
                }
                Err(TaskControl::Fatal(error)) => {
                    tracing::error!(task = %task.name, %error, "task failed, dropping it");
                    return Ok(acc);
                }
            }
        }
    }

    fn invoke_handler(
        &self,
        name: &str,
        kwargs: &mut Kwargs,
        acc: Vec<ProcessingResult>,
        retries: u32,
    ) -> std::result::Result<HandlerOutcome, TaskControl> {
        let request = TaskRequest { retries };
        match name {
            names::UPLOAD => {
                let args: UploadTaskArgs = parse_args(kwargs)?;
                UploadTask::new(Arc::clone(&self.services)).run(&args, kwargs, &request)?;
                Ok(HandlerOutcome::Done)
            }
            names::UPLOAD_PROCESSOR
            | names::BUNDLE_ANALYSIS_PROCESSOR
            | names::TEST_RESULTS_PROCESSOR => {
                let args: ProcessorArgs = parse_args(kwargs)?;
                let reply =
                    UploadProcessorTask::new(Arc::clone(&self.services)).run(&args, acc, &request)?;
                match reply {
                    TaskReply::Process {
                        processings_so_far, ..
                    } => Ok(HandlerOutcome::Accumulator(processings_so_far)),
                    _ => Ok(HandlerOutcome::Done),
                }
            }
            names::UPLOAD_FINISHER | names::TEST_RESULTS_FINISHER => {
                let args: FinisherArgs = parse_args(kwargs)?;
                let results = match kwargs.get("processing_results") {
                    Some(value) => serde_json::from_value(value.clone())
                        .map_err(|e| TaskControl::Fatal(e.into()))?,
                    None => acc,
                };
                UploadFinisherTask::new(Arc::clone(&self.services))
                    .run(&args, results, kwargs, &request)?;
                Ok(HandlerOutcome::Done)
            }
            names::NOTIFY | names::BUNDLE_ANALYSIS_NOTIFY => {
                self.deliver_notification(kwargs, NotifyKind::Normal)?;
                Ok(HandlerOutcome::Done)
            }
            names::NOTIFY_ERROR => {
                self.deliver_notification(kwargs, NotifyKind::Error)?;
                Ok(HandlerOutcome::Done)
            }
            names::STATUS_SET_PENDING => {
                tracing::info!("setting pending commit status");
                Ok(HandlerOutcome::Done)
            }
            unknown => {
                tracing::warn!(task = unknown, "no handler registered, dropping task");
                Ok(HandlerOutcome::Done)
            }
        }
    }

    fn deliver_notification(
        &self,
        kwargs: &Kwargs,
        kind: NotifyKind,
    ) -> std::result::Result<(), TaskControl> {
        let repo_id = kwargs
            .get("repoid")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| TaskControl::Fatal(anyhow::anyhow!("notify kwargs missing repoid")))?;
        let commit_sha = kwargs
            .get("commitid")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| TaskControl::Fatal(anyhow::anyhow!("notify kwargs missing commitid")))?;
        let commit = CommitRef::new(repo_id, commit_sha);
        let config = kwargs
            .get("current_yaml")
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| TaskControl::Fatal(anyhow::anyhow!("bad current_yaml: {e}")))?
            .unwrap_or_default();

        self.notifier
            .notify(&commit, &config, kind)
            .map_err(TaskControl::Fatal)?;

        // Close out the flow so the notification latency is measured.
        if let Ok(mut checkpoints) = CheckpointLogger::from_kwargs(&UPLOAD_FLOW, kwargs) {
            let _ = checkpoints.log_opts("NOTIFIED", true);
        }

        if let Some(mut row) = self
            .services
            .metadata
            .fetch_commit(&commit)
            .map_err(|e| TaskControl::Fatal(e.into()))?
        {
            row.notified = true;
            self.services
                .metadata
                .update_commit(&row)
                .map_err(|e| TaskControl::Fatal(e.into()))?;
        }
        Ok(())
    }

    fn log_retry_exhaustion(&self, kwargs: &Kwargs) {
        tracing::error!("retries exhausted, marking the flow failed");
        if let Ok(mut checkpoints) = CheckpointLogger::from_kwargs(&UPLOAD_FLOW, kwargs) {
            let _ = checkpoints.log_opts("UNCAUGHT_RETRY_EXCEPTION", true);
        }
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.services.kv
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }
}

enum HandlerOutcome {
    Accumulator(Vec<ProcessingResult>),
    Done,
}

fn parse_args<T: serde::de::DeserializeOwned>(kwargs: &Kwargs) -> Result<T, TaskControl> {
    serde_json::from_value(serde_json::Value::Object(kwargs.clone()))
        .map_err(|e| TaskControl::Fatal(anyhow::anyhow!("bad task kwargs: {e}")))
}
