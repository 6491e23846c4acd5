//! Retry schedules and backoff policies for pipeline tasks.
//!
//! Every retryable situation in the pipeline has a named schedule here, so
//! the backoff table lives in one place instead of being scattered across
//! task handlers. A schedule is a bounded number of retries plus a delay
//! function of the retry count; task handlers surface it as an explicit
//! `Retry { countdown }` control value rather than sleeping in place.
//!
//! # Example
//!
//! ```
//! use tributary_retry::RetrySchedule;
//!
//! let schedule = RetrySchedule::dispatcher_lock_contention();
//! assert!(!schedule.exhausted(2));
//! let delay = schedule.delay(1);
//! assert_eq!(delay.as_secs(), 40);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How the delay grows with the retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    /// Same delay on every retry.
    Fixed { delay_secs: u64 },
    /// `base · factor^n`, capped.
    Exponential {
        base_secs: u64,
        factor: u64,
        cap_secs: u64,
    },
    /// Pick uniformly from `[M/2, M]` where `M = base · factor^n`, capped.
    /// Spreads contending workers instead of stampeding them in lockstep.
    JitteredExponential {
        base_secs: u64,
        factor: u64,
        cap_secs: u64,
    },
}

/// A bounded retry schedule: maximum retry count plus delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_retries: u32,
    backoff: Backoff,
}

/// Fallback applied where a task does not name its own schedule.
const TASK_DEFAULT_DELAY_SECS: u64 = 180;

impl RetrySchedule {
    /// Dispatcher could not take the upload lock and the queue is non-empty.
    pub fn dispatcher_lock_contention() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base_secs: 20,
                factor: 2,
                cap_secs: 3600,
            },
        }
    }

    /// The commit row exists but its report cannot be initialised yet.
    pub fn report_not_ready() -> Self {
        Self {
            max_retries: u32::MAX,
            backoff: Backoff::Fixed { delay_secs: 60 },
        }
    }

    /// Another dispatcher currently holds the upload-processing lock.
    pub fn dispatcher_already_processing() -> Self {
        Self {
            max_retries: u32::MAX,
            backoff: Backoff::Fixed { delay_secs: 60 },
        }
    }

    /// Processor could not take the upload-processing lock.
    pub fn processor_lock_contention() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::JitteredExponential {
                base_secs: 200,
                factor: 3,
                cap_secs: 5 * 60 * 60,
            },
        }
    }

    /// Raw upload not yet visible in the object store; one grace retry only.
    pub fn raw_file_grace() -> Self {
        Self {
            max_retries: 1,
            backoff: Backoff::Fixed { delay_secs: 20 },
        }
    }

    /// Transient database failure (deadlock, dropped connection).
    pub fn db_transient() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Fixed {
                delay_secs: TASK_DEFAULT_DELAY_SECS,
            },
        }
    }

    /// Waiting on CI before notifying. A configured webhook is expected to
    /// wake the pipeline, so the retry is just a safety net and can be slow;
    /// without one, poll more eagerly but give up later.
    pub fn notifier_wait_for_ci(has_webhook: bool) -> Self {
        if has_webhook {
            Self {
                max_retries: 5,
                backoff: Backoff::Exponential {
                    base_secs: 180,
                    factor: 2,
                    cap_secs: 24 * 60 * 60,
                },
            }
        } else {
            Self {
                max_retries: 10,
                backoff: Backoff::Exponential {
                    base_secs: 15,
                    factor: 2,
                    cap_secs: 2 * 60 * 60,
                },
            }
        }
    }

    /// Provider apps are rate limited; wait for the window to reset.
    pub fn notifier_rate_limited() -> Self {
        Self {
            max_retries: 10,
            backoff: Backoff::Fixed { delay_secs: 0 },
        }
    }

    /// Whether `retry_num` retries already exhaust this schedule.
    pub fn exhausted(&self, retry_num: u32) -> bool {
        retry_num >= self.max_retries
    }

    /// Delay before retry number `retry_num` (0-indexed).
    pub fn delay(&self, retry_num: u32) -> Duration {
        let secs = match self.backoff {
            Backoff::Fixed { delay_secs } => delay_secs,
            Backoff::Exponential {
                base_secs,
                factor,
                cap_secs,
            } => grow(base_secs, factor, retry_num).min(cap_secs),
            Backoff::JitteredExponential {
                base_secs,
                factor,
                cap_secs,
            } => {
                let max = grow(base_secs, factor, retry_num);
                jittered_half_range(max).min(cap_secs)
            }
        };
        Duration::from_secs(secs)
    }
}

fn grow(base: u64, factor: u64, retry_num: u32) -> u64 {
    let pow = retry_num.min(16);
    base.saturating_mul(factor.saturating_pow(pow))
}

/// Uniform sample from `[max/2, max]`.
fn jittered_half_range(max: u64) -> u64 {
    use rand::RngExt;
    if max < 2 {
        return max;
    }
    rand::rng().random_range(max / 2..=max)
}

/// Debounce countdown for a commit whose latest upload is younger than the
/// configured processing delay: wait out the remainder, but at least 30s.
pub fn debounce_countdown(processing_delay: Duration, last_upload_age: Duration) -> Duration {
    let remainder = processing_delay.saturating_sub(last_upload_age);
    remainder.max(Duration::from_secs(30))
}

/// Countdown for provider rate limits: wait until the limit window resets
/// on the next full hour, but at least a minute.
pub fn rate_limit_countdown() -> Duration {
    Duration::from_secs(seconds_to_next_hour().max(60))
}

fn seconds_to_next_hour() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    3600 - (now % 3600)
}
