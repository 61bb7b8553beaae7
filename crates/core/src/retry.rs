//! Bounded retry with exponential backoff
//!
//! One implementation shared by signaling reconnection, ICE restart and
//! peer connection rebuilds.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// How often and how patiently to retry an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound for the delay between attempts
    pub max_backoff: Duration,
    /// Per-attempt timeout; `None` waits for the operation indefinitely
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            attempt_timeout: None,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Delay to wait after `failed_attempt` (1-based) failed
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Successful result together with the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a single attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{}", e),
            Self::TimedOut(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
        }
    }
}

/// Every attempt failed (or none was allowed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    NoAttempts,
    Exhausted {
        attempts: u32,
        last: AttemptFailure<E>,
    },
}

impl<E> RetryError<E> {
    /// Attempts consumed before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::NoAttempts => 0,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAttempts => f.write_str("retry budget exhausted before the first attempt"),
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempt(s): {}", attempts, last)
            },
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `operation` until it succeeds or the policy is exhausted
///
/// The closure receives the 1-based attempt number. There is no delay
/// after the final failed attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    if policy.max_attempts == 0 {
        return Err(RetryError::NoAttempts);
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let outcome = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation(attempt)).await {
                Ok(result) => result.map_err(AttemptFailure::Failed),
                Err(_) => Err(AttemptFailure::TimedOut(limit)),
            },
            None => operation(attempt).await.map_err(AttemptFailure::Failed),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            },
            Err(failure) => {
                if attempt >= policy.max_attempts {
                    tracing::warn!(
                        attempts = attempt,
                        error = %failure,
                        "Retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: failure,
                    });
                }

                let backoff = policy.backoff_for(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %failure,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(backoff).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));

        let result = retry_with_backoff(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(attempt * 10)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, 30);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4);

        let err = retry_with_backoff(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("boom") }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_bounds_each_try() {
        let policy = RetryPolicy::new(2)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(100))
            .with_attempt_timeout(Duration::from_secs(1));
        let started = Instant::now();

        let err = retry_with_backoff(&policy, |_| async {
            std::future::pending::<Result<(), &str>>().await
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RetryError::Exhausted {
                attempts: 2,
                last: AttemptFailure::TimedOut(_)
            }
        ));
        // two timeouts plus one backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2100));
        assert!(elapsed < Duration::from_millis(2200));
    }

    #[tokio::test]
    async fn test_zero_budget_runs_nothing() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&RetryPolicy::new(0), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, &str>(()) }
        })
        .await
        .unwrap_err();

        assert_eq!(err, RetryError::NoAttempts);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
