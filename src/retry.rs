//! Bounded retry and polling.
//!
//! Every wait loop in the crate goes through one of two shapes:
//!
//! - [`retry`]: run a fallible operation up to `max_attempts` times, each
//!   attempt bounded by a per-attempt timeout and all of them by an overall
//!   deadline, with exponential backoff in between. A predicate decides which
//!   errors are retryable; anything else aborts immediately.
//! - [`poll_until`]: check a condition at a fixed interval until it holds,
//!   a poll budget runs out, or a deadline passes.
//!
//! Both use `tokio::time`, so tests running with a paused clock advance
//! through sleeps instantly.
//!
//! # Tiger Style
//!
//! - Every loop has an explicit upper bound (attempts or polls or deadline)
//! - Backoff uses saturating arithmetic and is capped

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::UnsealTimings;

// ============================================================================
// Backoff
// ============================================================================

/// Result of a single backoff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// How long to sleep before the next attempt.
    pub sleep: Duration,
    /// Backoff to feed into the following step.
    pub next_backoff: Duration,
}

/// Compute the sleep for this step and the doubled (capped) next backoff.
///
/// Pure function: the current backoff is clamped to `max_backoff`, and the
/// next backoff never exceeds it.
#[inline]
pub fn compute_backoff(current_backoff: Duration, max_backoff: Duration) -> BackoffResult {
    let sleep = current_backoff.min(max_backoff);
    let doubled = sleep.saturating_mul(2);
    BackoffResult {
        sleep,
        next_backoff: doubled.min(max_backoff),
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Limits for [`retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least 1).
    pub max_attempts: u32,
    /// Deadline covering all attempts and the backoff between them.
    pub deadline: Option<Duration>,
    /// Timeout of a single attempt. A timed-out attempt is retryable.
    pub attempt_timeout: Option<Duration>,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Cap on the backoff between attempts.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Policy for submitting one unseal share: a fresh deadline, split evenly
    /// across the allowed attempts.
    pub fn share_submission(timings: &UnsealTimings) -> Self {
        let attempts = timings.share_submit_max_attempts.max(1);
        Self {
            max_attempts: attempts,
            deadline: Some(timings.share_submit_deadline),
            attempt_timeout: Some(timings.share_submit_deadline / attempts),
            initial_backoff: timings.share_submit_initial_backoff,
            max_backoff: timings.share_submit_max_backoff,
        }
    }

    /// Policy for persisting a fresh initialization record.
    pub fn record_persist(timings: &UnsealTimings) -> Self {
        Self {
            max_attempts: timings.record_persist_max_attempts.max(1),
            deadline: None,
            attempt_timeout: Some(timings.request_timeout),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Why [`retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable error.
    Fatal { attempt: u32, source: E },
    /// Every attempt failed with a retryable error or timed out.
    Exhausted {
        attempts: u32,
        /// Last retryable error, `None` when the last attempt timed out.
        last_error: Option<E>,
    },
    /// The overall deadline passed before attempts ran out.
    DeadlineExceeded { attempts: u32, last_error: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of attempts that were started.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } | RetryError::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` under `policy`.
///
/// `operation` receives the 1-based attempt number. Errors for which
/// `is_retryable` returns `false` abort immediately with
/// [`RetryError::Fatal`].
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let deadline = policy.deadline.map(|limit| Instant::now() + limit);
    let mut backoff = policy.initial_backoff;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let remaining = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt - 1,
                        last_error,
                    });
                }
                Some(remaining)
            }
            None => None,
        };
        let limit = match (policy.attempt_timeout, remaining) {
            (Some(per_attempt), Some(remaining)) => Some(per_attempt.min(remaining)),
            (per_attempt, remaining) => per_attempt.or(remaining),
        };

        let outcome = match limit {
            Some(limit) => tokio::time::timeout(limit, operation(attempt)).await.ok(),
            None => Some(operation(attempt).await),
        };

        match outcome {
            Some(Ok(value)) => return Ok(value),
            Some(Err(err)) if is_retryable(&err) => {
                debug!(operation = operation_name, attempt, max_attempts, "retryable failure");
                last_error = Some(err);
            }
            Some(Err(err)) => return Err(RetryError::Fatal { attempt, source: err }),
            None => {
                debug!(operation = operation_name, attempt, max_attempts, "attempt timed out");
                last_error = None;
            }
        }

        if attempt < max_attempts {
            let step = compute_backoff(backoff, policy.max_backoff);
            let sleep = match deadline {
                Some(deadline) => step.sleep.min(deadline.saturating_duration_since(Instant::now())),
                None => step.sleep,
            };
            tokio::time::sleep(sleep).await;
            backoff = step.next_backoff;
        }
    }

    Err(RetryError::Exhausted {
        attempts: max_attempts,
        last_error,
    })
}

// ============================================================================
// Polling
// ============================================================================

/// Limits for [`poll_until`]. At least one of `max_polls` and `deadline`
/// should be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Time between consecutive polls.
    pub interval: Duration,
    /// Maximum number of polls.
    pub max_polls: Option<u32>,
    /// Give up once this much time has passed since the first poll.
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    /// Seal-status polling after a share submission.
    pub fn seal_status(timings: &UnsealTimings) -> Self {
        Self {
            interval: timings.seal_status_poll_interval,
            max_polls: Some(timings.seal_status_max_polls),
            deadline: None,
        }
    }

    /// Registry polling during node discovery.
    pub fn discovery(timings: &UnsealTimings, timeout: Duration) -> Self {
        Self {
            interval: timings.discovery_poll_interval,
            max_polls: None,
            deadline: Some(timeout),
        }
    }
}

/// Result of [`poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check returned a value.
    Ready { value: T, polls: u32 },
    /// The poll budget or deadline ran out first.
    Exhausted { polls: u32, elapsed: Duration },
}

/// Check until it yields `Some`, the poll budget runs out, or the deadline
/// passes. A check error aborts polling and is returned as-is; checks that
/// want to tolerate transient failures return `Ok(None)` instead.
///
/// With a deadline set, each check is cut off when the deadline passes and
/// counts as a miss.
pub async fn poll_until<T, E, F, Fut>(policy: &PollPolicy, mut check: F) -> Result<PollOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = policy.deadline.map(|limit| started + limit);
    let mut polls = 0u32;

    loop {
        polls = polls.saturating_add(1);
        let checked = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, check(polls)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        debug!(poll = polls, "poll still pending at the deadline");
                        None
                    }
                }
            }
            None => check(polls).await?,
        };
        if let Some(value) = checked {
            return Ok(PollOutcome::Ready { value, polls });
        }

        if policy.max_polls.is_some_and(|max| polls >= max) {
            return Ok(PollOutcome::Exhausted {
                polls,
                elapsed: started.elapsed(),
            });
        }

        let sleep = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(PollOutcome::Exhausted {
                        polls,
                        elapsed: started.elapsed(),
                    });
                }
                policy.interval.min(remaining)
            }
            None => policy.interval,
        };
        tokio::time::sleep(sleep).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            deadline: Some(Duration::from_secs(60)),
            attempt_timeout: Some(Duration::from_secs(12)),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_compute_backoff_doubles_until_cap() {
        let step = compute_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(step.sleep, Duration::from_millis(100));
        assert_eq!(step.next_backoff, Duration::from_millis(200));

        let step = compute_backoff(Duration::from_millis(800), Duration::from_secs(1));
        assert_eq!(step.next_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_compute_backoff_clamps_current() {
        let step = compute_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(step.sleep, Duration::from_secs(1));
        assert_eq!(step.next_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_share_submission_policy_splits_deadline() {
        let policy = RetryPolicy::share_submission(&UnsealTimings::default());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.deadline, Some(Duration::from_secs(60)));
        assert_eq!(policy.attempt_timeout, Some(Duration::from_secs(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_retryable_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, RetryError<&str>> = retry(
            &policy(5),
            "test",
            |_| true,
            |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 { Err("busy") } else { Ok(attempt) }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_fatal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), RetryError<&str>> = retry(
            &policy(5),
            "test",
            |err: &&str| *err == "busy",
            |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("denied")
                }
            },
        )
        .await;

        match result {
            Err(RetryError::Fatal { attempt, source }) => {
                assert_eq!(attempt, 1);
                assert_eq!(source, "denied");
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_treats_attempt_timeout_as_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), RetryError<&str>> = retry(
            &policy(3),
            "test",
            |_| false,
            |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            },
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_none());
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_respects_overall_deadline() {
        let policy = RetryPolicy {
            max_attempts: 10,
            deadline: Some(Duration::from_secs(20)),
            attempt_timeout: Some(Duration::from_secs(12)),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        let started = Instant::now();

        let result: Result<(), RetryError<&str>> = retry(&policy, "test", |_| true, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(RetryError::DeadlineExceeded { attempts: 2, .. })));
        assert!(started.elapsed() <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready() {
        let policy = PollPolicy {
            interval: Duration::from_secs(6),
            max_polls: Some(10),
            deadline: None,
        };

        let outcome: PollOutcome<u32> = poll_until(&policy, |poll| async move {
            Ok::<_, ()>(if poll == 4 { Some(poll * 10) } else { None })
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready { value: 40, polls: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_exhausts_poll_budget() {
        let policy = PollPolicy {
            interval: Duration::from_secs(6),
            max_polls: Some(10),
            deadline: None,
        };
        let started = Instant::now();

        let outcome: PollOutcome<()> = poll_until(&policy, |_| async { Ok::<_, ()>(None) }).await.unwrap();

        assert!(matches!(outcome, PollOutcome::Exhausted { polls: 10, .. }));
        // No sleep after the final poll.
        assert_eq!(started.elapsed(), Duration::from_secs(54));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_deadline() {
        let policy = PollPolicy {
            interval: Duration::from_secs(1),
            max_polls: None,
            deadline: Some(Duration::from_secs(5)),
        };

        let outcome: PollOutcome<()> = poll_until(&policy, |_| async { Ok::<_, ()>(None) }).await.unwrap();

        match outcome {
            PollOutcome::Exhausted { polls, elapsed } => {
                assert_eq!(polls, 6);
                assert_eq!(elapsed, Duration::from_secs(5));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_cuts_off_a_hung_check_at_the_deadline() {
        let policy = PollPolicy {
            interval: Duration::from_secs(1),
            max_polls: None,
            deadline: Some(Duration::from_secs(5)),
        };
        let started = Instant::now();

        let outcome: PollOutcome<()> =
            poll_until(&policy, |_| std::future::pending::<Result<Option<()>, ()>>()).await.unwrap();

        assert!(matches!(outcome, PollOutcome::Exhausted { polls: 1, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_propagates_check_error() {
        let policy = PollPolicy {
            interval: Duration::from_secs(1),
            max_polls: Some(3),
            deadline: None,
        };

        let result: Result<PollOutcome<()>, &str> = poll_until(&policy, |_| async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));
    }
}
