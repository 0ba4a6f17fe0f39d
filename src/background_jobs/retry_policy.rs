//! Retry policy for failed job attempts.
//!
//! Fixed delay between attempts, bounded by the job's `max_attempts`.

use super::models::Job;
use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// Why an attempt ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The handler returned an error.
    Handler,
    /// The handler panicked.
    Panicked,
    /// The lease expired without a recorded outcome.
    Orphaned,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Handler => "failed",
            FailureCause::Panicked => "panic",
            FailureCause::Orphaned => "orphaned",
        }
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to Queued, due at `retry_at`.
    Retry {
        attempt_count: u32,
        retry_at: DateTime<Utc>,
    },
    /// Terminal Failed.
    Exhausted { attempt_count: u32 },
}

impl FailureDecision {
    pub fn attempt_count(&self) -> u32 {
        match *self {
            FailureDecision::Retry { attempt_count, .. } => attempt_count,
            FailureDecision::Exhausted { attempt_count } => attempt_count,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FailureDecision::Exhausted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts given to jobs whose handler does not override it.
    pub default_max_attempts: u32,
    /// Fixed delay between the end of a failed attempt and the next one.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(default_max_attempts: u32, retry_delay_secs: u64) -> Self {
        Self {
            default_max_attempts: default_max_attempts.max(1),
            retry_delay: Duration::seconds(retry_delay_secs as i64),
        }
    }

    /// Decide the fate of `job` after a failed attempt that ended at `now`.
    ///
    /// The failure consumes one attempt. A job that is already at its ceiling
    /// (possible after a manual retry) fails terminally without counting past
    /// `max_attempts`.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> FailureDecision {
        let attempt_count = job.attempt_count.saturating_add(1);
        if attempt_count < job.max_attempts {
            FailureDecision::Retry {
                attempt_count,
                retry_at: now + self.retry_delay,
            }
        } else {
            FailureDecision::Exhausted {
                attempt_count: attempt_count.min(job.max_attempts.max(job.attempt_count)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::models::{Actor, Payload};
    use chrono::TimeZone;

    fn job_with_attempts(attempt_count: u32, max_attempts: u32) -> Job {
        let mut job = Job::new_queued(
            "cleanup",
            Payload::empty(),
            None,
            max_attempts,
            &Actor::system("test"),
            Utc::now(),
        );
        job.attempt_count = attempt_count;
        job
    }

    #[test]
    fn test_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.default_max_attempts, 5);
        assert_eq!(policy.retry_delay, Duration::minutes(1));
    }

    #[test]
    fn test_retry_until_ceiling() {
        let policy = RetryPolicy::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        for attempts in 0..4 {
            let decision = policy.decide(&job_with_attempts(attempts, 5), now);
            assert_eq!(
                decision,
                FailureDecision::Retry {
                    attempt_count: attempts + 1,
                    retry_at: now + Duration::minutes(1),
                }
            );
        }

        let last = policy.decide(&job_with_attempts(4, 5), now);
        assert_eq!(last, FailureDecision::Exhausted { attempt_count: 5 });
    }

    #[test]
    fn test_failure_after_manual_retry_does_not_exceed_max() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&job_with_attempts(5, 5), Utc::now());
        assert_eq!(decision, FailureDecision::Exhausted { attempt_count: 5 });
        assert!(decision.is_exhausted());
    }

    #[test]
    fn test_single_attempt_job_fails_immediately() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&job_with_attempts(0, 1), Utc::now());
        assert_eq!(decision, FailureDecision::Exhausted { attempt_count: 1 });
    }

    #[test]
    fn test_custom_delay() {
        let policy = RetryPolicy::new(3, 300);
        let now = Utc::now();
        match policy.decide(&job_with_attempts(0, 3), now) {
            FailureDecision::Retry { retry_at, .. } => {
                assert!(retry_at - now >= Duration::minutes(5))
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }
}
