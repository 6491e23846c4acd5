//! The notification gate.
//!
//! Decides, once a commit's pipeline reaches a quiet point, whether the
//! notify task may be submitted, must be replaced by an error
//! notification, must wait for CI, or is skipped entirely. The gate is a
//! pure decision over its inputs plus provider calls; side effects (commit
//! rows, checkpoints, task submission) stay with the caller.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tributary_config::UserConfig;
use tributary_retry::{RetrySchedule, rate_limit_countdown};
use tributary_state::{UploadNumbers, should_trigger_postprocessing};
use tributary_types::{Commit, CommitRef, ProcessingResult};

use crate::provider::{ProviderClient, ProviderError};

/// Commit messages matching this are CI-skipped: the pipeline completes
/// but never notifies.
static CI_SKIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(ci|skip| |-){3,}\]").expect("static regex"));

pub fn is_ci_skip_message(message: &str) -> bool {
    CI_SKIP.is_match(message)
}

/// Why a notification is not (or not yet) sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoSuccessfulProcessing,
    PipelineNotQuiet,
    OtherPipelinesProcessing,
    ManualTrigger,
    AfterNBuilds { needed: u32, have: u32 },
    CiSkipCommit,
    LocalUpload,
    NoValidBot,
    CiClientError,
    CiServerError,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoSuccessfulProcessing => "no_successful_processing",
            SkipReason::PipelineNotQuiet => "no_postprocessing_needed",
            SkipReason::OtherPipelinesProcessing => "has_other_notifications_coming",
            SkipReason::ManualTrigger => "has_manual_trigger_setting",
            SkipReason::AfterNBuilds { .. } => "has_after_n_builds_setting",
            SkipReason::CiSkipCommit => "ci_skip_commit",
            SkipReason::LocalUpload => "local_upload",
            SkipReason::NoValidBot => "has_no_valid_bot",
            SkipReason::CiClientError => "not_able_fetch_ci_result",
            SkipReason::CiServerError => "server_issues_ci_result",
        }
    }
}

/// The gate's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShouldNotify {
    Notify,
    /// Send an error notification instead of a normal one.
    NotifyError { reason: String },
    Skip(SkipReason),
    /// Not decidable yet; retry the finisher after `countdown`.
    Wait {
        countdown: Duration,
        max_retries: u32,
        reason: String,
    },
}

/// Inputs the finisher assembles for one gate evaluation.
pub struct GateInputs<'a> {
    pub commit: &'a CommitRef,
    pub commit_row: &'a Commit,
    pub config: &'a UserConfig,
    pub processing_results: &'a [ProcessingResult],
    pub upload_numbers: UploadNumbers,
    /// Whether another report type's pipeline holds its upload-processing
    /// lock for this commit.
    pub other_pipelines_processing: bool,
    pub report_code: Option<&'a str>,
    /// Sessions currently in the master report, for `after_n_builds`.
    pub session_count: u32,
    /// Retry count of the evaluating task, for wait backoff.
    pub retries: u32,
}

pub fn evaluate(provider: &dyn ProviderClient, inputs: &GateInputs<'_>) -> ShouldNotify {
    if !inputs.processing_results.iter().any(|r| r.successful) {
        return ShouldNotify::Skip(SkipReason::NoSuccessfulProcessing);
    }

    if !should_trigger_postprocessing(inputs.upload_numbers) {
        return ShouldNotify::Skip(SkipReason::PipelineNotQuiet);
    }

    if inputs.other_pipelines_processing {
        return ShouldNotify::Skip(SkipReason::OtherPipelinesProcessing);
    }

    if inputs.config.manual_trigger() {
        return ShouldNotify::Skip(SkipReason::ManualTrigger);
    }

    let after_n_builds = inputs.config.after_n_builds();
    if after_n_builds > inputs.session_count {
        return ShouldNotify::Skip(SkipReason::AfterNBuilds {
            needed: after_n_builds,
            have: inputs.session_count,
        });
    }

    let any_failed = inputs.processing_results.iter().any(|r| !r.successful);
    if inputs.config.notify_error() && any_failed {
        return ShouldNotify::NotifyError {
            reason: "has_notify_error_setting".to_string(),
        };
    }

    let ci_status = match provider.get_ci_status(inputs.commit) {
        Ok(status) => status,
        Err(ProviderError::NoValidBot) | Err(ProviderError::RepoNotFound) => {
            return ShouldNotify::Skip(SkipReason::NoValidBot);
        }
        Err(ProviderError::RateLimited) => {
            let schedule = RetrySchedule::notifier_rate_limited();
            return ShouldNotify::Wait {
                countdown: rate_limit_countdown(),
                max_retries: schedule.max_retries,
                reason: "retrying_because_app_is_rate_limited".to_string(),
            };
        }
        Err(ProviderError::Client { .. }) => {
            return ShouldNotify::Skip(SkipReason::CiClientError);
        }
        Err(ProviderError::Server { .. }) => {
            return ShouldNotify::Skip(SkipReason::CiServerError);
        }
    };

    if inputs.config.wait_for_ci() && ci_status.is_none() {
        let schedule = RetrySchedule::notifier_wait_for_ci(inputs.commit_row.has_webhook);
        return ShouldNotify::Wait {
            countdown: schedule.delay(inputs.retries),
            max_retries: schedule.max_retries,
            reason: "retrying_because_wait_for_ci".to_string(),
        };
    }

    if inputs.config.require_ci_to_pass() && ci_status == Some(false) {
        return ShouldNotify::NotifyError {
            reason: "ci_failed".to_string(),
        };
    }

    if inputs.report_code.is_some() {
        // Local uploads never notify; report_code marks them.
        return ShouldNotify::Skip(SkipReason::LocalUpload);
    }

    if is_ci_skip_message(&inputs.commit_row.message) {
        return ShouldNotify::Skip(SkipReason::CiSkipCommit);
    }

    ShouldNotify::Notify
}

/// Which notification the pipeline asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// The regular PR comment / commit status fan-out.
    Normal,
    /// A summary of how many uploads failed to process.
    Error,
}

/// Renders and delivers user-visible notifications. External collaborator;
/// invoked at most once per commit per pipeline completion.
pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        commit: &CommitRef,
        config: &UserConfig,
        kind: NotifyKind,
    ) -> anyhow::Result<()>;
}

/// Notifier that only logs. Default for single-node and test runs.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(
        &self,
        commit: &CommitRef,
        _config: &UserConfig,
        kind: NotifyKind,
    ) -> anyhow::Result<()> {
        tracing::info!(
            repo_id = commit.repo_id,
            commit_sha = %commit.commit_sha,
            ?kind,
            "delivering notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tributary_types::CommitState;

    use super::*;
    use crate::provider::ScriptedProvider;

    fn commit_row(message: &str) -> Commit {
        Commit {
            repo_id: 1,
            commit_sha: "abc".to_string(),
            branch: "main".to_string(),
            pull_id: None,
            message: message.to_string(),
            state: CommitState::Pending,
            notified: false,
            session_count: 0,
            has_webhook: false,
        }
    }

    fn successful_results() -> Vec<ProcessingResult> {
        vec![ProcessingResult {
            upload_id: 1,
            successful: true,
            error: None,
        }]
    }

    struct Fixture {
        commit: CommitRef,
        commit_row: Commit,
        config: UserConfig,
        results: Vec<ProcessingResult>,
        provider: ScriptedProvider,
    }

    impl Fixture {
        fn new() -> Self {
            let provider = ScriptedProvider::new();
            provider.set_ci_status(Some(true));
            Self {
                commit: CommitRef::new(1, "abc"),
                commit_row: commit_row("feat: add thing"),
                config: UserConfig::default(),
                results: successful_results(),
                provider,
            }
        }

        fn evaluate(&self) -> ShouldNotify {
            evaluate(
                &self.provider,
                &GateInputs {
                    commit: &self.commit,
                    commit_row: &self.commit_row,
                    config: &self.config,
                    processing_results: &self.results,
                    upload_numbers: UploadNumbers {
                        processing: 0,
                        processed: 0,
                    },
                    other_pipelines_processing: false,
                    report_code: None,
                    session_count: 1,
                    retries: 0,
                },
            )
        }
    }

    #[test]
    fn quiet_successful_pipeline_notifies() {
        let fixture = Fixture::new();
        assert_eq!(fixture.evaluate(), ShouldNotify::Notify);
    }

    #[test]
    fn ci_skip_message_forms() {
        assert!(is_ci_skip_message("hotfix [ci skip]"));
        assert!(is_ci_skip_message("wip [skip ci]"));
        assert!(!is_ci_skip_message("fix skipping logic"));
        assert!(!is_ci_skip_message("plain message"));
    }

    #[test]
    fn ci_skip_commit_is_skipped() {
        let mut fixture = Fixture::new();
        fixture.commit_row = commit_row("hotfix [ci skip]");
        assert_eq!(
            fixture.evaluate(),
            ShouldNotify::Skip(SkipReason::CiSkipCommit)
        );
    }

    #[test]
    fn ci_skip_commit_still_waits_for_unresolved_ci() {
        // The skip message is only consulted once CI is resolved; with the
        // default wait_for_ci the gate keeps retrying first.
        let mut fixture = Fixture::new();
        fixture.commit_row = commit_row("hotfix [ci skip]");
        fixture.provider.set_ci_status(None);
        assert!(matches!(fixture.evaluate(), ShouldNotify::Wait { .. }));
    }

    #[test]
    fn failed_processing_wins_over_a_ci_skip_message() {
        let mut fixture = Fixture::new();
        fixture.commit_row = commit_row("hotfix [ci skip]");
        fixture.results = vec![ProcessingResult {
            upload_id: 1,
            successful: false,
            error: None,
        }];
        assert_eq!(
            fixture.evaluate(),
            ShouldNotify::Skip(SkipReason::NoSuccessfulProcessing)
        );
    }

    #[test]
    fn local_upload_is_skipped() {
        let fixture = Fixture::new();
        let verdict = evaluate(
            &fixture.provider,
            &GateInputs {
                commit: &fixture.commit,
                commit_row: &fixture.commit_row,
                config: &fixture.config,
                processing_results: &fixture.results,
                upload_numbers: UploadNumbers {
                    processing: 0,
                    processed: 0,
                },
                other_pipelines_processing: false,
                report_code: Some("local-run"),
                session_count: 1,
                retries: 0,
            },
        );
        assert_eq!(verdict, ShouldNotify::Skip(SkipReason::LocalUpload));
    }

    #[test]
    fn all_failed_processing_skips() {
        let mut fixture = Fixture::new();
        fixture.results = vec![ProcessingResult {
            upload_id: 1,
            successful: false,
            error: None,
        }];
        assert_eq!(
            fixture.evaluate(),
            ShouldNotify::Skip(SkipReason::NoSuccessfulProcessing)
        );
    }

    #[test]
    fn busy_pipeline_skips() {
        let fixture = Fixture::new();
        let verdict = evaluate(
            &fixture.provider,
            &GateInputs {
                commit: &fixture.commit,
                commit_row: &fixture.commit_row,
                config: &fixture.config,
                processing_results: &fixture.results,
                upload_numbers: UploadNumbers {
                    processing: 2,
                    processed: 0,
                },
                other_pipelines_processing: false,
                report_code: None,
                session_count: 1,
                retries: 0,
            },
        );
        assert_eq!(verdict, ShouldNotify::Skip(SkipReason::PipelineNotQuiet));
    }

    #[test]
    fn manual_trigger_disables_auto_notify() {
        let mut fixture = Fixture::new();
        fixture.config =
            UserConfig::from_yaml("codecov:\n  notify:\n    manual_trigger: true\n").expect("config");
        assert_eq!(
            fixture.evaluate(),
            ShouldNotify::Skip(SkipReason::ManualTrigger)
        );
    }

    #[test]
    fn after_n_builds_waits_for_sessions() {
        let mut fixture = Fixture::new();
        fixture.config =
            UserConfig::from_yaml("codecov:\n  notify:\n    after_n_builds: 3\n").expect("config");
        assert_eq!(
            fixture.evaluate(),
            ShouldNotify::Skip(SkipReason::AfterNBuilds { needed: 3, have: 1 })
        );
    }

    #[test]
    fn notify_error_fires_on_partial_failure() {
        let mut fixture = Fixture::new();
        fixture.config =
            UserConfig::from_yaml("codecov:\n  notify:\n    notify_error: true\n").expect("config");
        fixture.results.push(ProcessingResult {
            upload_id: 2,
            successful: false,
            error: None,
        });
        assert!(matches!(
            fixture.evaluate(),
            ShouldNotify::NotifyError { .. }
        ));
    }

    #[test]
    fn unknown_ci_with_webhook_waits_on_the_slow_schedule() {
        let mut fixture = Fixture::new();
        fixture.provider.set_ci_status(None);
        fixture.commit_row.has_webhook = true;
        let ShouldNotify::Wait {
            countdown,
            max_retries,
            ..
        } = fixture.evaluate()
        else {
            panic!("expected wait");
        };
        assert_eq!(countdown, Duration::from_secs(180));
        assert_eq!(max_retries, 5);
    }

    #[test]
    fn unknown_ci_without_webhook_polls_eagerly() {
        let mut fixture = Fixture::new();
        fixture.provider.set_ci_status(None);
        let ShouldNotify::Wait {
            countdown,
            max_retries,
            ..
        } = fixture.evaluate()
        else {
            panic!("expected wait");
        };
        assert_eq!(countdown, Duration::from_secs(15));
        assert_eq!(max_retries, 10);
    }

    #[test]
    fn failed_ci_produces_an_error_notification() {
        let mut fixture = Fixture::new();
        fixture.provider.set_ci_status(Some(false));
        assert!(matches!(
            fixture.evaluate(),
            ShouldNotify::NotifyError { .. }
        ));
    }

    #[test]
    fn failed_ci_is_ignored_when_not_required() {
        let mut fixture = Fixture::new();
        fixture.provider.set_ci_status(Some(false));
        fixture.config =
            UserConfig::from_yaml("codecov:\n  require_ci_to_pass: false\n").expect("config");
        assert_eq!(fixture.evaluate(), ShouldNotify::Notify);
    }

    #[test]
    fn unknown_ci_notifies_when_not_waiting() {
        let mut fixture = Fixture::new();
        fixture.provider.set_ci_status(None);
        fixture.config =
            UserConfig::from_yaml("codecov:\n  notify:\n    wait_for_ci: false\n").expect("config");
        assert_eq!(fixture.evaluate(), ShouldNotify::Notify);
    }

    #[test]
    fn missing_bot_skips_with_a_typed_reason() {
        let mut fixture = Fixture::new();
        fixture.provider.fail_with(|| ProviderError::NoValidBot);
        assert_eq!(fixture.evaluate(), ShouldNotify::Skip(SkipReason::NoValidBot));
    }

    #[test]
    fn rate_limited_apps_wait_for_the_window() {
        let mut fixture = Fixture::new();
        fixture.provider.fail_with(|| ProviderError::RateLimited);
        let ShouldNotify::Wait {
            countdown,
            max_retries,
            ..
        } = fixture.evaluate()
        else {
            panic!("expected wait");
        };
        assert!(countdown >= Duration::from_secs(60));
        assert_eq!(max_retries, 10);
    }
}
