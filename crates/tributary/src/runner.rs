//! Task signatures, control flow, and the broker seam.
//!
//! Tasks are identified by name and carry JSON-serialisable kwargs; the
//! checkpoint envelope rides along in those kwargs. Handlers never raise to
//! retry: they return an explicit [`TaskControl::Retry`] that the runner
//! interprets, so retry behaviour is visible in the type signature.
//!
//! [`TaskRunner`] abstracts the broker. The pipeline only needs three
//! shapes: a single task, a sequential chain, and a fan-out with a single
//! gathering body (chord).

use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tributary_config::UserConfig;
use tributary_retry::RetrySchedule;
use tributary_types::TaskReply;

/// Broker-visible task names.
pub mod names {
    pub const UPLOAD: &str = "app.tasks.upload.Upload";
    pub const UPLOAD_PROCESSOR: &str = "app.tasks.upload_processor.UploadProcessorTask";
    pub const UPLOAD_FINISHER: &str = "app.tasks.upload_finisher.UploadFinisherTask";
    pub const NOTIFY: &str = "app.tasks.notify.Notify";
    pub const NOTIFY_ERROR: &str = "app.tasks.notify_error.NotifyErrorTask";
    pub const STATUS_SET_PENDING: &str = "app.tasks.status.SetPending";
    pub const BUNDLE_ANALYSIS_PROCESSOR: &str =
        "app.tasks.bundle_analysis.BundleAnalysisProcessor";
    pub const BUNDLE_ANALYSIS_NOTIFY: &str = "app.tasks.bundle_analysis.BundleAnalysisNotify";
    pub const TEST_RESULTS_PROCESSOR: &str = "app.tasks.test_results.TestResultsProcessor";
    pub const TEST_RESULTS_FINISHER: &str = "app.tasks.test_results.TestResultsFinisher";
}

pub type Kwargs = serde_json::Map<String, Value>;

/// One schedulable task: name, kwargs, optional countdown.
#[derive(Debug, Clone)]
pub struct TaskSignature {
    pub name: String,
    pub kwargs: Kwargs,
    pub countdown: Option<Duration>,
}

impl TaskSignature {
    pub fn new(name: &str, kwargs: Kwargs) -> Self {
        Self {
            name: name.to_string(),
            kwargs,
            countdown: None,
        }
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn kwarg_i64(&self, key: &str) -> Option<i64> {
        self.kwargs.get(key).and_then(Value::as_i64)
    }

    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }
}

/// Why a handler did not produce a reply. Interpreted by the runner.
#[derive(Debug)]
pub enum TaskControl {
    /// Re-enqueue the same task after `countdown`, giving up once the
    /// retry count reaches `max_retries`.
    Retry {
        countdown: Duration,
        max_retries: u32,
    },
    /// Programmer error or unrecoverable state; the task is dropped and
    /// operators intervene.
    Fatal(anyhow::Error),
}

impl TaskControl {
    /// Retry per a named schedule, given how many retries already ran.
    pub fn retry(schedule: &RetrySchedule, retries: u32) -> Self {
        TaskControl::Retry {
            countdown: schedule.delay(retries),
            max_retries: schedule.max_retries,
        }
    }

    /// Retry after an explicit countdown with no schedule bound.
    pub fn retry_after(countdown: Duration) -> Self {
        TaskControl::Retry {
            countdown,
            max_retries: u32::MAX,
        }
    }
}

impl From<anyhow::Error> for TaskControl {
    fn from(error: anyhow::Error) -> Self {
        TaskControl::Fatal(error)
    }
}

pub type TaskResult = std::result::Result<TaskReply, TaskControl>;

/// Broker-side context a handler can see about its own invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRequest {
    /// How many times this task has already been retried.
    pub retries: u32,
}

/// The broker surface the pipeline schedules through.
pub trait TaskRunner: Send + Sync {
    fn submit(&self, task: TaskSignature) -> anyhow::Result<()>;
    /// Run tasks strictly one after another, each receiving the previous
    /// task's accumulator.
    fn chain(&self, tasks: Vec<TaskSignature>) -> anyhow::Result<()>;
    /// Run the group in any order, then the body once all complete.
    fn chord(&self, group: Vec<TaskSignature>, body: TaskSignature) -> anyhow::Result<()>;
}

/// Work submitted to a [`RecordingRunner`].
#[derive(Debug, Clone)]
pub enum ScheduledWork {
    Single(TaskSignature),
    Chain(Vec<TaskSignature>),
    Chord {
        group: Vec<TaskSignature>,
        body: TaskSignature,
    },
}

/// Runner that records submissions instead of executing them. Tests assert
/// on the recorded task graph; the worker binary drives it as its queue.
#[derive(Default)]
pub struct RecordingRunner {
    scheduled: Mutex<Vec<ScheduledWork>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_scheduled(&self) -> Vec<ScheduledWork> {
        std::mem::take(&mut self.scheduled.lock().unwrap())
    }

    pub fn scheduled(&self) -> Vec<ScheduledWork> {
        self.scheduled.lock().unwrap().clone()
    }

    /// All task names submitted so far, flattening chains and chords.
    pub fn submitted_names(&self) -> Vec<String> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .flat_map(|work| match work {
                ScheduledWork::Single(task) => vec![task.name.clone()],
                ScheduledWork::Chain(tasks) => tasks.iter().map(|t| t.name.clone()).collect(),
                ScheduledWork::Chord { group, body } => group
                    .iter()
                    .map(|t| t.name.clone())
                    .chain(std::iter::once(body.name.clone()))
                    .collect(),
            })
            .collect()
    }
}

impl TaskRunner for RecordingRunner {
    fn submit(&self, task: TaskSignature) -> anyhow::Result<()> {
        self.scheduled.lock().unwrap().push(ScheduledWork::Single(task));
        Ok(())
    }

    fn chain(&self, tasks: Vec<TaskSignature>) -> anyhow::Result<()> {
        self.scheduled.lock().unwrap().push(ScheduledWork::Chain(tasks));
        Ok(())
    }

    fn chord(&self, group: Vec<TaskSignature>, body: TaskSignature) -> anyhow::Result<()> {
        self.scheduled
            .lock()
            .unwrap()
            .push(ScheduledWork::Chord { group, body });
        Ok(())
    }
}

/// Queue and time limits resolved for one task submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub queue: String,
    pub soft_timelimit: Option<Duration>,
    pub hard_timelimit: Option<Duration>,
}

const DEFAULT_QUEUE: &str = "celery";
const UPLOADS_QUEUE: &str = "uploads";

/// Resolve `(queue, soft limit, hard limit)` for a task at submit time.
///
/// Upload-family tasks ride the uploads queue, enterprise plans get their
/// own queue prefix, and `setup.tasks.*` config overrides both limits and
/// queue per task family.
pub fn route_task(task_name: &str, user_plan: &str, config: &UserConfig) -> RouteConfig {
    let family = task_family(task_name);
    let base_queue = if matches!(
        family,
        "upload" | "upload_processor" | "upload_finisher" | "bundle_analysis" | "test_results"
    ) {
        UPLOADS_QUEUE
    } else {
        DEFAULT_QUEUE
    };

    let mut route = RouteConfig {
        queue: base_queue.to_string(),
        soft_timelimit: None,
        hard_timelimit: None,
    };

    if let Some(task_override) = config.task_override(family) {
        if let Some(queue) = &task_override.queue {
            route.queue = queue.clone();
        }
        route.soft_timelimit = task_override.soft_timelimit.map(Duration::from_secs);
        route.hard_timelimit = task_override.hard_timelimit.map(Duration::from_secs);
    }

    if user_plan.starts_with("enterprise") {
        route.queue = format!("enterprise_{}", route.queue);
    }
    route
}

/// The family segment of a task name: `app.tasks.<family>.<Class>`.
fn task_family(task_name: &str) -> &str {
    task_name.split('.').nth(2).unwrap_or(task_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_control_follows_the_schedule() {
        let schedule = RetrySchedule::dispatcher_lock_contention();
        let TaskControl::Retry {
            countdown,
            max_retries,
        } = TaskControl::retry(&schedule, 1)
        else {
            panic!("expected retry");
        };
        assert_eq!(countdown, Duration::from_secs(40));
        assert_eq!(max_retries, 3);
    }

    #[test]
    fn recording_runner_flattens_names() {
        let runner = RecordingRunner::new();
        runner
            .chain(vec![
                TaskSignature::new(names::UPLOAD_PROCESSOR, Kwargs::new()),
                TaskSignature::new(names::UPLOAD_FINISHER, Kwargs::new()),
            ])
            .expect("chain");
        runner
            .submit(TaskSignature::new(names::NOTIFY, Kwargs::new()))
            .expect("submit");

        assert_eq!(
            runner.submitted_names(),
            vec![
                names::UPLOAD_PROCESSOR.to_string(),
                names::UPLOAD_FINISHER.to_string(),
                names::NOTIFY.to_string(),
            ]
        );
    }

    #[test]
    fn upload_tasks_ride_the_uploads_queue() {
        let route = route_task(names::UPLOAD, "users-basic", &UserConfig::default());
        assert_eq!(route.queue, "uploads");
        assert_eq!(route.soft_timelimit, None);
    }

    #[test]
    fn other_tasks_ride_the_default_queue() {
        let route = route_task(names::NOTIFY, "users-basic", &UserConfig::default());
        assert_eq!(route.queue, "celery");
    }

    #[test]
    fn enterprise_plans_get_a_prefixed_queue() {
        let route = route_task(names::UPLOAD, "enterprise-cloud", &UserConfig::default());
        assert_eq!(route.queue, "enterprise_uploads");
    }

    #[test]
    fn config_overrides_queue_and_limits() {
        let config = UserConfig::from_yaml(
            r#"
setup:
  tasks:
    upload:
      soft_timelimit: 400
      hard_timelimit: 480
      queue: special
"#,
        )
        .expect("config");
        let route = route_task(names::UPLOAD, "users-basic", &config);
        assert_eq!(route.queue, "special");
        assert_eq!(route.soft_timelimit, Some(Duration::from_secs(400)));
        assert_eq!(route.hard_timelimit, Some(Duration::from_secs(480)));
    }

    #[test]
    fn countdown_rides_on_the_signature() {
        let task = TaskSignature::new(names::UPLOAD, Kwargs::new())
            .with_countdown(Duration::from_secs(60));
        assert_eq!(task.countdown, Some(Duration::from_secs(60)));
    }
}
