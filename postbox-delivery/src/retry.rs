//! Retry policy for failed delivery attempts
//!
//! A pure decision function: given the attempt number and the current
//! instant, decide whether the message is requeued (and when it becomes
//! eligible again) or terminally failed. Deterministic by design so retry
//! schedules are reproducible; no jitter.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Retry configuration for the dispatch subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of failed attempts to retry after.
    ///
    /// Default: 2 retries (three attempts in total).
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base retry interval in seconds.
    ///
    /// The wait before attempt `n + 1` is `n * retry_interval_secs`: one
    /// interval after the first failure, two after the second, and so on.
    ///
    /// Default: 900 seconds (15 minutes).
    #[serde(default = "defaults::retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Wall-clock bound on a whole dispatch run, in seconds.
    ///
    /// Default: 180 seconds.
    #[serde(default = "defaults::batch_delivery_timeout_secs")]
    pub batch_delivery_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            retry_interval_secs: defaults::retry_interval_secs(),
            batch_delivery_timeout_secs: defaults::batch_delivery_timeout_secs(),
        }
    }
}

/// Outcome of applying the retry policy to one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the message for a later run.
    Requeue {
        /// New failed-attempt count to record on the message.
        number_of_retries: u32,
        /// When the message becomes dispatch-eligible again.
        scheduled_time: DateTime<Utc>,
    },
    /// Retries exhausted; the message fails terminally. The retry counter
    /// and scheduled time keep their last values.
    Fail,
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The base retry interval as a duration.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::seconds(i64::try_from(self.retry_interval_secs).unwrap_or(i64::MAX))
    }

    /// The batch timeout as a std duration, for the runner.
    #[must_use]
    pub const fn batch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.batch_delivery_timeout_secs)
    }

    /// Decide the fate of a message whose `attempt`-th attempt just failed.
    ///
    /// Attempts are 1-indexed: `attempt` is the total number of failures
    /// including the one being decided. The backoff multiplier is linear:
    /// attempt 1 waits one interval, attempt 2 waits two.
    #[must_use]
    pub fn decide(&self, attempt: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempt <= self.max_retries {
            RetryDecision::Requeue {
                number_of_retries: attempt,
                scheduled_time: now + self.retry_interval() * i32::try_from(attempt).unwrap_or(i32::MAX),
            }
        } else {
            RetryDecision::Fail
        }
    }
}


mod defaults {
    pub const fn max_retries() -> u32 {
        2
    }

    pub const fn retry_interval_secs() -> u64 {
        900 // 15 minutes
    }

    pub const fn batch_delivery_timeout_secs() -> u64 {
        180
    }
}
