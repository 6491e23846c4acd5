//! # Tributary
//!
//! The background-processing engine of a code-coverage service.
//!
//! Coverage and test-result uploads for a source-control commit are parsed,
//! merged into a running per-commit report, and — once the set of uploads
//! for the commit is complete — used to trigger user-visible notifications.
//! Many worker processes consume tasks from a broker, and many uploads may
//! arrive concurrently for the same commit from different CI jobs.
//!
//! ## Pipeline
//!
//! The flow for one commit is **dispatch → process × N → finish → notify**:
//!
//! 1. [`dispatcher::UploadTask`] drains the commit's argument queue,
//!    normalises the upload descriptors, and builds the task graph.
//! 2. [`processor::UploadProcessorTask`] parses one chunk of uploads into
//!    intermediate reports and records their processing state.
//! 3. [`finisher::UploadFinisherTask`] merges intermediate reports into the
//!    master report in bounded batches and, once the commit is quiet,
//!    evaluates the notification gate.
//! 4. The gate submits at most one notify task per commit pipeline.
//!
//! Workers coordinate exclusively through the key-value store: per-commit
//! locks, the argument queue, the processing-state sets, and the
//! intermediate reports all live there. The relational rows (commits,
//! uploads) are authoritative and the KV state can be reconstructed from
//! them after total loss.
//!
//! ## Modules
//!
//! - [`report`] — the mergeable report model and the parser seam
//! - [`storage`] — object storage backends for raw uploads and reports
//! - [`metadata`] — commit/upload row persistence seam
//! - [`provider`] — git-provider seam (diffs, CI status, webhooks)
//! - [`intermediate`] — compressed intermediate-report store
//! - [`context`] — per-commit upload context: queues, debounce, kwargs
//! - [`runner`] — task signatures, control flow, broker seam, routing
//! - [`session`] — session-id allocation for serial and parallel merges
//! - [`dispatcher`] — the upload task (entry point per commit)
//! - [`processor`] — the upload processor task
//! - [`finisher`] — the upload finisher task
//! - [`gate`] — the notification gate

/// The mergeable report model and the parser seam.
pub mod report;

/// Object storage backends for raw uploads and persisted reports.
pub mod storage;

/// Commit/upload row persistence seam.
pub mod metadata;

/// Git-provider seam: commit refresh, webhooks, diffs, CI status.
pub mod provider;

/// Compressed intermediate-report store between processing and merging.
pub mod intermediate;

/// Per-commit upload context: queue draining, normalisation, debounce.
pub mod context;

/// Task signatures, explicit retry control flow, broker seam, routing.
pub mod runner;

/// Session-id allocation for serial and parallel merges.
pub mod session;

/// The upload task: drains the queue and schedules the task graph.
pub mod dispatcher;

/// The upload processor task: parses uploads into intermediate reports.
pub mod processor;

/// The upload finisher task: batched merges and the postprocessing trigger.
pub mod finisher;

/// The notification gate.
pub mod gate;
