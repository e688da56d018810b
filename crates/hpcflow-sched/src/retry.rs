//! Bounded exponential backoff for transient remote failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{SchedError, SchedResult};

/// How often and how patiently to retry a transient failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Undithered delay after failed attempt number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let half = base / 2;
        let spread = (base - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// The last error of an operation that did not succeed, and how many attempts it took.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: u32,
    pub error: SchedError,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempt budget is spent.
///
/// The closure receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SchedResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, max_attempts, error, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(Exhausted {
                    attempts: attempt,
                    error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use hpcflow_remote::RemoteError;
    use proptest::prelude::*;

    use super::*;

    fn connect_error() -> SchedError {
        SchedError::Remote(RemoteError::Connect("connection reset".into()))
    }

    #[test]
    fn test_base_delay_doubles_then_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_secs(2), Duration::from_secs(10))
            .without_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(4), Duration::from_secs(10));
        assert_eq!(policy.base_delay(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::default(), "upload", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(connect_error())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default().with_max_attempts(4);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy, "upload", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(connect_error()) }
        })
        .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 4);
        assert!(exhausted.error.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), "verify", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SchedError::Corruption {
                    path: "/scratch/a".into(),
                    expected: "aa".into(),
                    found: "bb".into(),
                })
            }
        })
        .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            attempt in 1u32..64,
        ) {
            let policy = RetryPolicy::default()
                .with_backoff(Duration::from_millis(initial_ms), Duration::from_millis(max_ms));
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt);
            prop_assert!(base <= policy.max_backoff);
            prop_assert!(delay <= base);
            prop_assert!(delay >= base / 2);
        }

        #[test]
        fn prop_base_delay_is_monotonic(initial_ms in 1u64..5_000, attempt in 1u32..40) {
            let policy = RetryPolicy::default()
                .with_backoff(Duration::from_millis(initial_ms), Duration::from_secs(300));
            prop_assert!(policy.base_delay(attempt) <= policy.base_delay(attempt + 1));
        }
    }
}
