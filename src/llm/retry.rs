//! Retry, backoff, and the global concurrency cap shared by every LLM call.
//!
//! The backoff/jitter math and the circuit-breaker state machine are the same shapes used
//! elsewhere in this codebase's rate limiting and error-recovery layers, generalized here to a
//! single reusable helper rather than duplicated per call site.

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::LlmError;

/// Computes exponential backoff with ±10% jitter, capped, for retry attempt `attempt` (0-based).
pub fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt);
    let raw_ms = (base_secs.saturating_mul(multiplier)).saturating_mul(1000);
    let jitter = rand::rng().random_range(-0.1..0.1);
    let jittered_ms = (raw_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms).min(Duration::from_secs(cap_secs))
}

/// Three-state circuit breaker guarding a downstream LLM provider: `Closed` passes every call
/// through, `Open` rejects calls until a cooldown elapses, `HalfOpen` (modeled implicitly by
/// the cooldown check) allows a single probe call through to decide whether to close again.
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    opened_at_epoch_ms: AtomicU64,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_epoch_ms: AtomicU64::new(0),
            failure_threshold,
            cooldown,
        }
    }

    /// `now_ms` is supplied by the caller (rather than read from the clock internally) so this
    /// type stays unit-testable without depending on wall-clock time.
    pub fn can_proceed(&self, now_ms: u64) -> bool {
        let opened_at = self.opened_at_epoch_ms.load(Ordering::Relaxed);
        if opened_at == 0 {
            return true;
        }
        now_ms.saturating_sub(opened_at) >= self.cooldown.as_millis() as u64
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.opened_at_epoch_ms.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self, now_ms: u64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            self.opened_at_epoch_ms.store(now_ms, Ordering::Relaxed);
            warn!(failures, "circuit breaker opened after repeated LLM failures");
        }
    }
}

/// Wraps LLM invocations with the global concurrency cap (default 16 in-flight calls).
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }
}

/// Retries `op` up to `max_retries` times with exponential backoff, stopping early on a
/// non-retriable error. Used by both the AI Architect Planner's per-step calls and the
/// Content Analyzer's per-chunk calls, with their own retry budgets.
pub async fn retry_with_backoff<F, Fut, T>(
    max_retries: u32,
    base_secs: u64,
    cap_secs: u64,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < max_retries => {
                let delay = backoff_delay(attempt, base_secs, cap_secs);
                debug!(attempt, ?delay, %err, "retrying LLM call after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;

    #[test]
    fn backoff_is_capped() {
        let d = backoff_delay(10, 2, 8);
        assert!(d <= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retry_stops_on_non_retriable_error() {
        let calls = Counter::new(0);
        let result: Result<(), LlmError> = retry_with_backoff(3, 0, 1, || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(LlmError::Authentication("bad key".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retry_recovers_after_two_transient_failures() {
        let calls = Counter::new(0);
        let result = retry_with_backoff(3, 0, 1, || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 2 {
                    Err(LlmError::Network("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn circuit_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(100));
        assert!(breaker.can_proceed(0));
        breaker.record_failure(0);
        assert!(breaker.can_proceed(0));
        breaker.record_failure(0);
        assert!(!breaker.can_proceed(0));
        assert!(breaker.can_proceed(101));
    }
}
