//! User-facing YAML configuration for the upload pipeline.
//!
//! Config arrives in up to three layers — per-owner, per-repo, and
//! per-commit — each an independently parsed YAML document. The effective
//! config merges them field-wise with the commit layer winning over the
//! repo layer winning over the owner layer.
//!
//! Only the options the pipeline acts on are typed here; anything else in
//! the documents is carried as opaque extras so a round trip never drops
//! user data.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One parsed configuration layer. All recognised fields are optional so
/// layers can be merged; use the accessor methods on the merged value to
/// get defaulted readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "CodecovSection::is_empty")]
    pub codecov: CodecovSection,
    #[serde(default, skip_serializing_if = "SetupSection::is_empty")]
    pub setup: SetupSection,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecovSection {
    #[serde(default, skip_serializing_if = "NotifySection::is_empty")]
    pub notify: NotifySection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_ci_to_pass: Option<bool>,
    #[serde(default, skip_serializing_if = "ArchiveSection::is_empty")]
    pub archive: ArchiveSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifySection {
    /// Minimum number of sessions in the master report before notifying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_n_builds: Option<u32>,
    /// When set, automatic notification is disabled; a separate manual
    /// trigger fires it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_trigger: Option<bool>,
    /// Emit an error notification instead of a normal one when some
    /// uploads failed to process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_error: Option<bool>,
    /// Defer notification until the commit's CI outcome is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_ci: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSection {
    /// Keep raw uploads in the object store after processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploads: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupSection {
    /// Debounce window in seconds: how long after the latest upload the
    /// dispatcher waits before committing to a task graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_processing_delay: Option<u64>,
    /// Per-task routing and time-limit overrides, keyed by task name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<String, TaskOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_timelimit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_timelimit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl CodecovSection {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl NotifySection {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ArchiveSection {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl SetupSection {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl UserConfig {
    /// Parse one YAML layer.
    pub fn from_yaml(source: &str) -> Result<Self> {
        serde_yaml::from_str(source).context("failed to parse user config YAML")
    }

    /// Merge three layers into the effective config. Later (more specific)
    /// layers win field-by-field.
    pub fn final_config(
        owner: Option<&UserConfig>,
        repo: Option<&UserConfig>,
        commit: Option<&UserConfig>,
    ) -> UserConfig {
        let mut merged = UserConfig::default();
        for layer in [owner, repo, commit].into_iter().flatten() {
            merged.apply(layer);
        }
        merged
    }

    fn apply(&mut self, layer: &UserConfig) {
        let notify = &layer.codecov.notify;
        merge_opt(&mut self.codecov.notify.after_n_builds, &notify.after_n_builds);
        merge_opt(&mut self.codecov.notify.manual_trigger, &notify.manual_trigger);
        merge_opt(&mut self.codecov.notify.notify_error, &notify.notify_error);
        merge_opt(&mut self.codecov.notify.wait_for_ci, &notify.wait_for_ci);
        merge_opt(
            &mut self.codecov.require_ci_to_pass,
            &layer.codecov.require_ci_to_pass,
        );
        merge_opt(&mut self.codecov.archive.uploads, &layer.codecov.archive.uploads);
        merge_opt(
            &mut self.setup.upload_processing_delay,
            &layer.setup.upload_processing_delay,
        );
        for (task, task_override) in &layer.setup.tasks {
            let merged = self.setup.tasks.entry(task.clone()).or_default();
            merge_opt(&mut merged.soft_timelimit, &task_override.soft_timelimit);
            merge_opt(&mut merged.hard_timelimit, &task_override.hard_timelimit);
            merge_opt(&mut merged.queue, &task_override.queue);
        }
        for (key, value) in &layer.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    // Defaulted readings of the recognised options.

    pub fn after_n_builds(&self) -> u32 {
        self.codecov.notify.after_n_builds.unwrap_or(0)
    }

    pub fn manual_trigger(&self) -> bool {
        self.codecov.notify.manual_trigger.unwrap_or(false)
    }

    pub fn notify_error(&self) -> bool {
        self.codecov.notify.notify_error.unwrap_or(false)
    }

    pub fn wait_for_ci(&self) -> bool {
        self.codecov.notify.wait_for_ci.unwrap_or(true)
    }

    pub fn require_ci_to_pass(&self) -> bool {
        self.codecov.require_ci_to_pass.unwrap_or(true)
    }

    pub fn archive_uploads(&self) -> bool {
        self.codecov.archive.uploads.unwrap_or(true)
    }

    pub fn upload_processing_delay(&self) -> Option<Duration> {
        self.setup.upload_processing_delay.map(Duration::from_secs)
    }

    pub fn task_override(&self, task_name: &str) -> Option<&TaskOverride> {
        self.setup.tasks.get(task_name)
    }
}

fn merge_opt<T: Clone>(target: &mut Option<T>, layer: &Option<T>) {
    if let Some(value) = layer {
        *target = Some(value.clone());
    }
}
