//! Flow-scoped checkpoint logging across task hops.
//!
//! A "flow" is a declared set of named events with a designated start event,
//! success terminals, failure terminals, and optional subflows — (name,
//! begin, end) triples for which a latency is emitted automatically when the
//! end event is logged after the begin event.
//!
//! Flows track latencies and reliabilities for higher-level sequences that
//! span several tasks on several workers. The checkpoint map is serialised
//! into the task-argument envelope on every enqueue and restored on every
//! dequeue, so a flow begun on one host can finish on another (as long as
//! clock drift is marginal).
//!
//! Flow declarations are static values registered at compile time; there is
//! no runtime mutation of the event sets.
//!
//! # Example
//!
//! ```
//! use tributary_checkpoint::{CheckpointLogger, UPLOAD_FLOW};
//!
//! let mut checkpoints = CheckpointLogger::new(&UPLOAD_FLOW);
//! checkpoints.log("UPLOAD_TASK_BEGIN").unwrap();
//! checkpoints.log("PROCESSING_BEGIN").unwrap();
//!
//! let mut kwargs = serde_json::Map::new();
//! checkpoints.save_to_kwargs(&mut kwargs);
//! assert!(kwargs.contains_key("checkpoints_UploadFlow"));
//! ```

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The event is not part of the flow. Always an error: it is a code
    /// mistake, not a data race.
    #[error("checkpoint {event} is not part of flow {flow}")]
    UnknownEvent { flow: &'static str, event: String },
    /// A subflow end was declared before its begin in the flow ordering.
    #[error("subflow end {end} is not after start {begin} in flow {flow}")]
    InvertedSubflow {
        flow: &'static str,
        begin: &'static str,
        end: &'static str,
    },
}

/// A named latency measurement inside a flow.
#[derive(Debug, Clone, Copy)]
pub struct Subflow {
    pub name: &'static str,
    pub begin: &'static str,
    pub end: &'static str,
}

/// Static declaration of a flow: its events (first one is the start event),
/// terminal sets, and subflows.
#[derive(Debug, Clone, Copy)]
pub struct FlowSpec {
    pub name: &'static str,
    pub events: &'static [&'static str],
    pub success_events: &'static [&'static str],
    pub failure_events: &'static [&'static str],
    pub subflows: &'static [Subflow],
}

impl FlowSpec {
    pub fn start_event(&self) -> &'static str {
        self.events[0]
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.contains(&event)
    }

    pub fn is_success(&self, event: &str) -> bool {
        self.success_events.contains(&event)
    }

    pub fn is_failure(&self, event: &str) -> bool {
        self.failure_events.contains(&event)
    }

    /// Key under which this flow's checkpoint data travels in task kwargs.
    pub fn kwargs_key(&self) -> String {
        format!("checkpoints_{}", self.name)
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events.iter().position(|e| *e == event)
    }
}

/// Sink for the begun/ended/succeeded/failed reliability counters.
///
/// The default sink emits counters as structured tracing events; tests can
/// substitute a recording sink.
pub trait CounterSink {
    fn increment(&self, counter: &str);
}

/// Emits each counter increment as a tracing event.
#[derive(Debug, Default)]
pub struct TracingCounters;

impl CounterSink for TracingCounters {
    fn increment(&self, counter: &str) {
        tracing::info!(counter, "flow counter increment");
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Tracks checkpoints for one flow instance.
///
/// Can be reconstructed from serialised data via [`from_kwargs`] so a flow
/// continues across worker hops.
pub struct CheckpointLogger {
    spec: &'static FlowSpec,
    data: BTreeMap<String, u64>,
    counters: Box<dyn CounterSink>,
}

impl std::fmt::Debug for CheckpointLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointLogger")
            .field("spec", &self.spec)
            .field("data", &self.data)
            .finish()
    }
}

impl CheckpointLogger {
    pub fn new(spec: &'static FlowSpec) -> Self {
        Self {
            spec,
            data: BTreeMap::new(),
            counters: Box::new(TracingCounters),
        }
    }

    pub fn with_counters(mut self, counters: Box<dyn CounterSink>) -> Self {
        self.counters = counters;
        self
    }

    /// Restore a logger from the checkpoint envelope in task kwargs.
    /// Checkpoints recorded against unknown events are rejected: they were
    /// made with a different flow.
    pub fn from_kwargs(
        spec: &'static FlowSpec,
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, CheckpointError> {
        let mut data = BTreeMap::new();
        if let Some(serde_json::Value::Object(map)) = kwargs.get(&spec.kwargs_key()) {
            for (event, value) in map {
                if !spec.contains(event) {
                    return Err(CheckpointError::UnknownEvent {
                        flow: spec.name,
                        event: event.clone(),
                    });
                }
                if let Some(millis) = value.as_u64() {
                    data.insert(event.clone(), millis);
                }
            }
        }
        Ok(Self {
            spec,
            data,
            counters: Box::new(TracingCounters),
        })
    }

    /// Serialise the checkpoint map into task kwargs so the next task can
    /// continue the flow.
    pub fn save_to_kwargs(&self, kwargs: &mut serde_json::Map<String, serde_json::Value>) {
        let map: serde_json::Map<String, serde_json::Value> = self
            .data
            .iter()
            .map(|(event, millis)| (event.clone(), serde_json::Value::from(*millis)))
            .collect();
        kwargs.insert(self.spec.kwargs_key(), serde_json::Value::Object(map));
    }

    pub fn has_begun(&self) -> bool {
        self.data.contains_key(self.spec.start_event())
    }

    /// Log an event at the current wall clock.
    pub fn log(&mut self, event: &str) -> Result<&mut Self, CheckpointError> {
        self.log_opts(event, false)
    }

    /// Log an event, optionally tolerating a repeat (task retries re-log
    /// their begin event).
    pub fn log_opts(
        &mut self,
        event: &str,
        ignore_repeat: bool,
    ) -> Result<&mut Self, CheckpointError> {
        self.log_at(event, ignore_repeat, unix_millis())
    }

    /// Log an event at an explicit timestamp. Exposed for replay and tests;
    /// production callers use [`log`].
    pub fn log_at(
        &mut self,
        event: &str,
        ignore_repeat: bool,
        millis: u64,
    ) -> Result<&mut Self, CheckpointError> {
        if !self.spec.contains(event) {
            return Err(CheckpointError::UnknownEvent {
                flow: self.spec.name,
                event: event.to_string(),
            });
        }
        if self.data.contains_key(event) {
            if !ignore_repeat {
                tracing::warn!(flow = self.spec.name, event, "checkpoint already recorded");
            }
            return Ok(self);
        }
        self.data.insert(event.to_string(), millis);

        for subflow in self.spec.subflows {
            if subflow.end == event
                && let Some(duration) = self.subflow_duration(subflow.begin, subflow.end)?
            {
                tracing::info!(
                    flow = self.spec.name,
                    subflow = subflow.name,
                    duration_ms = duration,
                    "subflow complete"
                );
            }
        }
        self.log_counters(event);
        Ok(self)
    }

    /// Milliseconds between two recorded checkpoints; `None` if either is
    /// missing (e.g. the begin was logged by an older worker version).
    pub fn subflow_duration(
        &self,
        begin: &'static str,
        end: &'static str,
    ) -> Result<Option<u64>, CheckpointError> {
        let (Some(begin_pos), Some(end_pos)) = (self.spec.position(begin), self.spec.position(end))
        else {
            return Err(CheckpointError::UnknownEvent {
                flow: self.spec.name,
                event: begin.to_string(),
            });
        };
        if end_pos <= begin_pos {
            return Err(CheckpointError::InvertedSubflow {
                flow: self.spec.name,
                begin,
                end,
            });
        }
        let (Some(start), Some(finish)) = (self.data.get(begin), self.data.get(end)) else {
            return Ok(None);
        };
        Ok(Some(finish.saturating_sub(*start)))
    }

    fn log_counters(&self, event: &str) {
        self.counters
            .increment(&format!("{}.events.{}", self.spec.name, event));

        if event == self.spec.start_event() {
            self.counters
                .increment(&format!("{}.total.begun", self.spec.name));
            return;
        }

        let is_failure = self.spec.is_failure(event);
        let is_success = self.spec.is_success(event);
        if is_failure {
            self.counters
                .increment(&format!("{}.total.failed", self.spec.name));
        } else if is_success {
            self.counters
                .increment(&format!("{}.total.succeeded", self.spec.name));
        }
        if is_failure || is_success {
            self.counters
                .increment(&format!("{}.total.ended", self.spec.name));
        }
    }

    pub fn data(&self) -> &BTreeMap<String, u64> {
        &self.data
    }
}

/// The coverage upload flow, from task begin to notification.
pub static UPLOAD_FLOW: FlowSpec = FlowSpec {
    name: "UploadFlow",
    events: &[
        "UPLOAD_TASK_BEGIN",
        "NO_PENDING_JOBS",
        "TOO_MANY_RETRIES",
        "PROCESSING_BEGIN",
        "INITIAL_PROCESSING_COMPLETE",
        "NO_REPORTS_FOUND",
        "BATCH_PROCESSING_COMPLETE",
        "PROCESSING_COMPLETE",
        "SKIPPING_NOTIFICATION",
        "NOTIFIED",
        "NOTIF_LOCK_ERROR",
        "NOTIF_NO_VALID_INTEGRATION",
        "NOTIF_GIT_CLIENT_ERROR",
        "NOTIF_GIT_SERVICE_ERROR",
        "NOTIF_TOO_MANY_RETRIES",
        "NOTIF_STALE_HEAD",
        "NOTIF_ERROR_NO_REPORT",
        "UNCAUGHT_RETRY_EXCEPTION",
        "CELERY_TIMEOUT",
        "CELERY_FAILURE",
    ],
    success_events: &[
        "SKIPPING_NOTIFICATION",
        "NOTIFIED",
        "NO_PENDING_JOBS",
        "NOTIF_STALE_HEAD",
    ],
    failure_events: &[
        "TOO_MANY_RETRIES",
        "NOTIF_LOCK_ERROR",
        "NOTIF_NO_VALID_INTEGRATION",
        "NOTIF_GIT_CLIENT_ERROR",
        "NOTIF_GIT_SERVICE_ERROR",
        "NOTIF_TOO_MANY_RETRIES",
        "NOTIF_ERROR_NO_REPORT",
        "UNCAUGHT_RETRY_EXCEPTION",
        "CELERY_TIMEOUT",
        "CELERY_FAILURE",
    ],
    subflows: &[
        Subflow {
            name: "time_before_processing",
            begin: "UPLOAD_TASK_BEGIN",
            end: "PROCESSING_BEGIN",
        },
        Subflow {
            name: "initial_processing_duration",
            begin: "PROCESSING_BEGIN",
            end: "INITIAL_PROCESSING_COMPLETE",
        },
        Subflow {
            name: "batch_processing_duration",
            begin: "INITIAL_PROCESSING_COMPLETE",
            end: "BATCH_PROCESSING_COMPLETE",
        },
        Subflow {
            name: "total_processing_duration",
            begin: "PROCESSING_BEGIN",
            end: "PROCESSING_COMPLETE",
        },
        Subflow {
            name: "notification_latency",
            begin: "UPLOAD_TASK_BEGIN",
            end: "NOTIFIED",
        },
    ],
};

/// The test-results flow.
pub static TEST_RESULTS_FLOW: FlowSpec = FlowSpec {
    name: "TestResultsFlow",
    events: &[
        "TEST_RESULTS_BEGIN",
        "TEST_RESULTS_PROCESSING_BEGIN",
        "TEST_RESULTS_FINISHER_BEGIN",
        "TEST_RESULTS_NOTIFY",
        "TEST_RESULTS_ERROR",
        "UNCAUGHT_RETRY_EXCEPTION",
        "CELERY_TIMEOUT",
        "CELERY_FAILURE",
    ],
    success_events: &["TEST_RESULTS_NOTIFY"],
    failure_events: &[
        "TEST_RESULTS_ERROR",
        "UNCAUGHT_RETRY_EXCEPTION",
        "CELERY_TIMEOUT",
        "CELERY_FAILURE",
    ],
    subflows: &[Subflow {
        name: "test_results_latency",
        begin: "TEST_RESULTS_BEGIN",
        end: "TEST_RESULTS_NOTIFY",
    }],
};
