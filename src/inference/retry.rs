//! Bounded retry with exponential backoff and jitter.
//!
//! [`RetryPolicy::execute`] wraps any fallible async operation whose error
//! type implements [`Classify`]. Non-retryable verdicts and exhausted budgets
//! return immediately with the attempt count attached.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::classifier::{Classify, ErrorVerdict};
use super::config::RetrySettings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Default ceiling for computed backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);

/// Upper bound for server-suggested delays (`Retry-After`).
pub const DEFAULT_MAX_SUGGESTED_DELAY: Duration = Duration::from_secs(60);

/// Jitter applied to computed backoff: ±30%.
const JITTER_FRACTION: f64 = 0.3;

// ─── RetryError ──────────────────────────────────────────────────────────────

/// The last failure of an operation that could not be completed.
#[derive(Debug)]
pub struct RetryError<E> {
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// Classification of the final failure.
    pub verdict: ErrorVerdict,
    /// The final underlying error.
    pub error: E,
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt{} ({})",
            self.error,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.verdict.category
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ─── RetryPolicy ─────────────────────────────────────────────────────────────

/// Retry budget and backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_suggested_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_suggested_delay: DEFAULT_MAX_SUGGESTED_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Build a policy; `max_delay` is raised to `base_delay` if it is smaller.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_suggested_delay: DEFAULT_MAX_SUGGESTED_DELAY,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        let mut policy = Self::new(
            settings.max_retries,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        );
        policy.max_suggested_delay = Duration::from_millis(settings.max_suggested_delay_ms);
        policy
    }

    /// Backoff for the retry following failed attempt `attempt` (0-based).
    ///
    /// `min(max, base * 2^attempt)` with ±30% jitter, clamped to `[base, max]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION);
        self.backoff_with_jitter(attempt, jitter)
    }

    fn backoff_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        exponential
            .mul_f64(1.0 + jitter)
            .clamp(self.base_delay, self.max_delay)
    }

    /// Delay before the next attempt, honoring a server-suggested override.
    pub fn delay_for(&self, attempt: u32, verdict: &ErrorVerdict) -> Duration {
        match verdict.suggested_delay {
            Some(suggested) => suggested.min(self.max_suggested_delay),
            None => self.backoff_delay(attempt),
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent.
    ///
    /// The closure receives the 0-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let verdict = error.classify();
                    if !verdict.retryable || attempt >= self.max_retries {
                        return Err(RetryError {
                            attempts: attempt + 1,
                            verdict,
                            error,
                        });
                    }

                    let delay = self.delay_for(attempt, &verdict);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        category = %verdict.category,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::classifier::ErrorCategory;
    use crate::inference::errors::InferenceError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..12 {
            for jitter in [-JITTER_FRACTION, -0.1, 0.0, 0.1, JITTER_FRACTION] {
                let d = policy.backoff_with_jitter(attempt, jitter);
                assert!(d >= policy.base_delay, "attempt {attempt}: {d:?} below base");
                assert!(d <= policy.max_delay, "attempt {attempt}: {d:?} above max");
            }
            let random = policy.backoff_delay(attempt);
            assert!(random >= policy.base_delay && random <= policy.max_delay);
        }
    }

    #[test]
    fn test_backoff_grows_until_clamped() {
        let policy = RetryPolicy::default();
        let d0 = policy.backoff_with_jitter(0, 0.0);
        let d1 = policy.backoff_with_jitter(1, 0.0);
        let d2 = policy.backoff_with_jitter(2, 0.0);
        let d3 = policy.backoff_with_jitter(3, 0.0);
        assert_eq!(d0, Duration::from_millis(1_000));
        assert_eq!(d1, Duration::from_millis(2_000));
        assert_eq!(d2, Duration::from_millis(4_000));
        assert_eq!(d3, Duration::from_millis(8_000));
        assert_eq!(policy.backoff_with_jitter(4, 0.0), policy.max_delay);
        assert_eq!(policy.backoff_with_jitter(40, 0.0), policy.max_delay);
    }

    #[test]
    fn test_suggested_delay_overrides_backoff() {
        let policy = RetryPolicy::default();
        let verdict = ErrorVerdict {
            category: ErrorCategory::RateLimit,
            retryable: true,
            suggested_delay: Some(Duration::from_secs(25)),
        };
        // Above max_delay but below the sanity bound: used as-is.
        assert_eq!(policy.delay_for(0, &verdict), Duration::from_secs(25));

        let huge = ErrorVerdict {
            suggested_delay: Some(Duration::from_secs(3_600)),
            ..verdict
        };
        assert_eq!(policy.delay_for(0, &huge), DEFAULT_MAX_SUGGESTED_DELAY);
    }

    #[test]
    fn test_max_delay_never_below_base() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_server_errors_then_success_makes_three_attempts() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .execute(|_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(InferenceError::http(503, "unavailable"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_authentication_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InferenceError::http(401, "bad key")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.verdict.category, ErrorCategory::Authentication);
    }

    #[tokio::test]
    async fn test_bad_request_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InferenceError::http(400, "malformed")) }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(InferenceError::ConnectionFailed {
                        endpoint: "https://x".into(),
                        reason: "refused".into(),
                    })
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.verdict.category, ErrorCategory::Network);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_rate_limit_retries_with_suggested_delay() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(InferenceError::HttpError {
                            status: 429,
                            body: String::new(),
                            retry_after: Some(Duration::from_millis(2)),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(0)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InferenceError::Timeout { duration_secs: 1 }) }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
