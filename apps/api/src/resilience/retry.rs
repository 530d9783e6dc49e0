//! Retry policy: error classification and backoff delays.
//!
//! `next_delay` and `with_jitter` are pure so delay sequences can be asserted
//! without timers. `RetryPolicy::run` drives an async operation through them.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

// ────────────────────────────────────────────────────────────────────────────
// Classification
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by the subscription layer and the generation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "category")]
pub enum ErrorCategory {
    /// Network blips, timeouts, momentary 5xx. Retried with backoff.
    Transient,
    /// Upstream throttling. Retried with the longer of the advised and computed delay.
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    /// Credential failure. Surfaced immediately, flagged for operators.
    Authentication,
    /// Caller-supplied data is malformed. Surfaced immediately.
    Validation,
    /// Provider is down or its circuit is open. Skip to the next provider.
    ProviderUnavailable,
}

impl ErrorCategory {
    /// Whether the same operation against the same upstream may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::ProviderUnavailable => "provider_unavailable",
        }
    }
}

/// Implemented by every domain error that can flow through a retry loop.
pub trait Classify {
    fn category(&self) -> ErrorCategory;
}

// ────────────────────────────────────────────────────────────────────────────
// Backoff
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
}

/// Delay before retry number `attempt` (0-based for exponential, 1-based for linear).
///
/// - exponential: `min(max, base * 2^attempt)`
/// - linear: `min(max, base * attempt)`
pub fn next_delay(
    strategy: BackoffStrategy,
    attempt: u32,
    base: Duration,
    max: Duration,
) -> Duration {
    let base_ms = base.as_millis() as u64;
    let raw_ms = match strategy {
        BackoffStrategy::Exponential => {
            let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
            base_ms.saturating_mul(factor)
        }
        BackoffStrategy::Linear => base_ms.saturating_mul(attempt as u64),
    };
    Duration::from_millis(raw_ms).min(max)
}

/// Spreads `delay` uniformly within `±fraction` so concurrent consumers don't retry in lockstep.
pub fn with_jitter<R: Rng + ?Sized>(delay: Duration, fraction: f64, rng: &mut R) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + rng.gen_range(-fraction..=fraction);
    delay.mul_f64(factor.max(0.0))
}

// ────────────────────────────────────────────────────────────────────────────
// Retry loop
// ────────────────────────────────────────────────────────────────────────────

/// Bookkeeping for one retry loop. Discarded on success, reported on exhaustion.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_category: Option<ErrorCategory>,
    pub next_retry_at: Option<Instant>,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempts: 0,
            last_category: None,
            next_retry_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{category:?} error, not retried: {source}")]
    NonRetryable {
        category: ErrorCategory,
        #[source]
        source: E,
    },

    #[error("gave up after {} attempts: {source}", .state.attempts)]
    Exhausted {
        state: RetryState,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn into_source(self) -> E {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    pub fn source_ref(&self) -> &E {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::NonRetryable { .. } => 1,
            Self::Exhausted { state, .. } => state.attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `failed_attempt` (1-based).
    pub fn delay_for(&self, failed_attempt: u32, category: ErrorCategory) -> Duration {
        let step = match self.strategy {
            BackoffStrategy::Exponential => failed_attempt.saturating_sub(1),
            BackoffStrategy::Linear => failed_attempt,
        };
        let computed = next_delay(self.strategy, step, self.base_delay, self.max_delay);
        let computed = with_jitter(computed, self.jitter, &mut rand::thread_rng());

        match category {
            // Provider-advised backoff wins when it is longer.
            ErrorCategory::RateLimited {
                retry_after_ms: Some(ms),
            } => computed.max(Duration::from_millis(ms)),
            ErrorCategory::RateLimited { retry_after_ms: None } => {
                computed.saturating_mul(2).min(self.max_delay.max(computed))
            }
            _ => computed,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable category, or
    /// `max_attempts` is reached.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Classify + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_until(operation, None, op).await
    }

    /// Like [`run`](Self::run), but gives up with `Exhausted` as soon as the
    /// next retry could not start before `deadline`.
    pub async fn run_until<T, E, F, Fut>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Classify + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut state = RetryState::new();

        loop {
            state.attempts += 1;
            let err = match op(state.attempts).await {
                Ok(value) => {
                    if state.attempts > 1 {
                        debug!("{operation} succeeded on attempt {}", state.attempts);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let category = err.category();
            state.last_category = Some(category);

            if !category.is_retryable() {
                warn!(
                    "{operation} failed with non-retryable {} error: {err}",
                    category.label()
                );
                return Err(RetryError::NonRetryable {
                    category,
                    source: err,
                });
            }

            if state.attempts >= self.max_attempts.max(1) {
                warn!(
                    "{operation} exhausted {} attempts, last error: {err}",
                    state.attempts
                );
                state.next_retry_at = None;
                return Err(RetryError::Exhausted { state, source: err });
            }

            let delay = self.delay_for(state.attempts, category);
            let retry_at = Instant::now() + delay;
            if deadline.is_some_and(|deadline| retry_at >= deadline) {
                warn!(
                    "{operation} attempt {} failed ({}) and the {}ms backoff outlasts its deadline: {err}",
                    state.attempts,
                    category.label(),
                    delay.as_millis()
                );
                state.next_retry_at = None;
                return Err(RetryError::Exhausted { state, source: err });
            }
            state.next_retry_at = Some(retry_at);
            warn!(
                "{operation} attempt {}/{} failed ({}), retrying after {}ms: {err}",
                state.attempts,
                self.max_attempts,
                category.label(),
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("test error ({0:?})")]
    struct TestError(ErrorCategory);

    impl Classify for TestError {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_exponential_delays_double_and_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        let delays: Vec<u128> = (0..6)
            .map(|a| next_delay(BackoffStrategy::Exponential, a, base, max).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_linear_delays_grow_by_base_and_cap() {
        let base = Duration::from_millis(250);
        let max = Duration::from_millis(900);
        let delays: Vec<u128> = (1..=5)
            .map(|a| next_delay(BackoffStrategy::Linear, a, base, max).as_millis())
            .collect();
        assert_eq!(delays, vec![250, 500, 750, 900, 900]);
    }

    #[test]
    fn test_exponential_huge_attempt_does_not_overflow() {
        let d = next_delay(
            BackoffStrategy::Exponential,
            200,
            Duration::from_millis(100),
            Duration::from_secs(30),
        );
        assert_eq!(d, Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = with_jitter(base, 0.2, &mut rng).as_millis();
            assert!((800..=1200).contains(&d), "jittered delay {d} out of range");
        }
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Duration::from_millis(1234);
        assert_eq!(with_jitter(base, 0.0, &mut rng), base);
    }

    #[test]
    fn test_rate_limited_honours_retry_after() {
        let p = policy(3);
        let d = p.delay_for(
            1,
            ErrorCategory::RateLimited {
                retry_after_ms: Some(3000),
            },
        );
        assert_eq!(d, Duration::from_millis(3000));
    }

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(!ErrorCategory::Authentication.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::ProviderUnavailable.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("op", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError(ErrorCategory::Transient))
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
    async fn test_run_stops_immediately_on_authentication() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorCategory::Authentication)) }
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::NonRetryable {
                category: ErrorCategory::Authentication,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_gives_up_when_backoff_outlasts_deadline() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), _> = policy(3)
            .run_until("op", Some(started + Duration::from_secs(120)), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TestError(ErrorCategory::RateLimited {
                        retry_after_ms: Some(10_000_000),
                    }))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { state, .. }) => {
                assert_eq!(state.attempts, 1);
                assert_eq!(state.next_retry_at, None);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_retries_within_deadline() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run_until("op", Some(Instant::now() + Duration::from_secs(120)), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(TestError(ErrorCategory::Transient))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_exhaustion_state() {
        let result: Result<(), _> = policy(4)
            .run("op", |_| async { Err(TestError(ErrorCategory::Transient)) })
            .await;
        match result {
            Err(RetryError::Exhausted { state, .. }) => {
                assert_eq!(state.attempts, 4);
                assert_eq!(state.last_category, Some(ErrorCategory::Transient));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
