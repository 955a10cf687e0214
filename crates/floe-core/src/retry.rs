//! Generic bounded retry with exponential backoff.
//!
//! Every external call in the pipeline (storage writes, warehouse jobs,
//! offset commits) runs inside a [`RetryPolicy`]. Callers supply an error
//! classifier so that semantic failures abort immediately while transient
//! ones back off and retry, and a cancellation token so that in-flight
//! retries unwind promptly on shutdown.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Classification of an operation error, decided by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff.
    Transient,
    /// Semantic failure; retrying cannot help.
    Fatal,
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The policy's attempt or duration budget ran out.
    Exhausted { attempts: u32, source: E },
    /// The last error was classified fatal.
    Aborted { source: E },
    /// Shutdown was requested while retrying.
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted { attempts, source } => {
                write!(f, "retries exhausted after {attempts} attempts: {source}")
            }
            RetryError::Aborted { source } => write!(f, "aborted, not retriable: {source}"),
            RetryError::Cancelled => write!(f, "cancelled by shutdown"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source } => Some(source),
            RetryError::Cancelled => None,
        }
    }
}

impl<E> RetryError<E> {
    /// The underlying operation error, if the failure carries one.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source } => Some(source),
            RetryError::Cancelled => None,
        }
    }
}

/// Bounded retry policy: exponential backoff from `base_delay` doubling up
/// to `max_delay`, capped by both an attempt count and a total duration,
/// with proportional jitter applied to every sleep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_duration: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy with the given backoff bounds, unbounded attempts, and the
    /// given total-duration budget.
    pub fn with_duration(base_delay: Duration, max_delay: Duration, max_duration: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            max_duration,
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    /// Single-attempt policy (used when retries are disabled).
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            max_duration: Duration::MAX,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Cap the number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Backoff delay for a zero-based attempt number, before jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exponential.min(self.max_delay)
    }

    /// Apply proportional jitter to a delay.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Budget remains; the backoff sleep has been taken.
    Retry,
    /// Attempt or duration budget is spent.
    Exhausted,
    /// Shutdown fired during the backoff sleep.
    Cancelled,
}

/// Attempt bookkeeping for one retried operation.
///
/// [`run_with_retries`] covers operations expressible as a closure; loops
/// that need to re-borrow mutable state between attempts drive a
/// `Retrier` directly.
pub struct Retrier {
    policy: RetryPolicy,
    started: Instant,
    attempt: u32,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            attempt: 0,
        }
    }

    /// Zero-based number of the attempt about to run (or just failed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and, if budget remains, sleep the backoff.
    pub async fn backoff(&mut self, shutdown: &CancellationToken) -> BackoffDecision {
        let attempts = self.attempt + 1;
        if attempts >= self.policy.max_attempts || self.started.elapsed() >= self.policy.max_duration
        {
            return BackoffDecision::Exhausted;
        }

        let delay = self.policy.jittered(self.policy.delay_for_attempt(self.attempt));
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying after backoff"
        );

        self.attempt = attempts;
        tokio::select! {
            _ = shutdown.cancelled() => BackoffDecision::Cancelled,
            _ = tokio::time::sleep(delay) => BackoffDecision::Retry,
        }
    }
}

/// Run `operation` under `policy` until it succeeds, the policy is
/// exhausted, the error is classified fatal, or `shutdown` fires.
///
/// The zero-based attempt number is passed to the operation so callers can
/// derive attempt-scoped idempotency keys (deterministic job ids).
/// `on_failed_attempt` is invoked for every failure before the backoff
/// sleep; it must not fail.
pub async fn run_with_retries<T, E, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    classify: impl Fn(&E) -> ErrorClass,
    mut on_failed_attempt: impl FnMut(u32, &E),
    mut operation: impl FnMut(u32) -> Fut,
) -> Result<T, RetryError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut retrier = Retrier::new(policy.clone());

    loop {
        if shutdown.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation(retrier.attempt()).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                on_failed_attempt(retrier.attempt(), &error);

                if classify(&error) == ErrorClass::Fatal {
                    return Err(RetryError::Aborted { source: error });
                }

                match retrier.backoff(shutdown).await {
                    BackoffDecision::Retry => {}
                    BackoffDecision::Exhausted => {
                        return Err(RetryError::Exhausted {
                            attempts: retrier.attempt() + 1,
                            source: error,
                        });
                    }
                    BackoffDecision::Cancelled => return Err(RetryError::Cancelled),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            max_duration: Duration::from_secs(5),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let shutdown = CancellationToken::new();
        let result: Result<u32, RetryError<std::io::Error>> = run_with_retries(
            &fast_policy(3),
            &shutdown,
            |_| ErrorClass::Transient,
            |_, _| {},
            |_| async { Ok(42) },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_with_attempt_numbers() {
        let shutdown = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = run_with_retries(
            &fast_policy(5),
            &shutdown,
            |_: &std::io::Error| ErrorClass::Transient,
            |_, _| {},
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(std::io::Error::other("transient"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        // Attempt numbers are zero-based and increase by one per retry.
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let shutdown = CancellationToken::new();
        let result: Result<(), _> = run_with_retries(
            &fast_policy(3),
            &shutdown,
            |_: &std::io::Error| ErrorClass::Transient,
            |_, _| {},
            |_| async { Err(std::io::Error::other("still broken")) },
        )
        .await;
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_aborts_immediately() {
        let shutdown = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retries(
            &fast_policy(10),
            &shutdown,
            |_: &std::io::Error| ErrorClass::Fatal,
            |_, _| {},
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(std::io::Error::other("semantic")) }
            },
        )
        .await;
        assert!(matches!(result.unwrap_err(), RetryError::Aborted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result: Result<(), _> = run_with_retries(
            &fast_policy(10),
            &shutdown,
            |_: &std::io::Error| ErrorClass::Transient,
            |_, _| {},
            |_| async { Err(std::io::Error::other("never runs")) },
        )
        .await;
        assert!(matches!(result.unwrap_err(), RetryError::Cancelled));
    }

    #[tokio::test]
    async fn test_on_failed_attempt_sees_every_failure() {
        let shutdown = CancellationToken::new();
        let mut seen = Vec::new();
        let _: Result<(), _> = run_with_retries(
            &fast_policy(3),
            &shutdown,
            |_: &std::io::Error| ErrorClass::Transient,
            |attempt, _| seen.push(attempt),
            |_| async { Err(std::io::Error::other("boom")) },
        )
        .await;
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            max_duration: Duration::from_secs(60),
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(91),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(40));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(80));
        // capped
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(91));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(91));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 1,
            max_duration: Duration::MAX,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        };
        for _ in 0..100 {
            let delay = policy.jittered(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(9));
            assert!(delay <= Duration::from_secs(11));
        }
    }
}
