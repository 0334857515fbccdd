//! Retry orchestration driven by error kinds and server advice.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_core::{ErrorMap, Result, ShoalError};

/// Default delay for retriable errors with no server advice.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(10);
/// Ceiling on a single default-strategy delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(500);

/// Re-runs operations whose failures are retryable.
///
/// The orchestrator consumes the error variant, never panics or throws:
/// a non-retryable error returns immediately, a retryable one sleeps per
/// the server's published strategy (constant, linear, exponential) when
/// the error map carries one, otherwise per a small exponential default.
/// The caller's time budget always wins over the retry schedule.
#[derive(Debug, Clone)]
pub struct RetryOrchestrator {
    budget: Duration,
    max_attempts: u32,
    error_map: Option<Arc<ErrorMap>>,
}

impl RetryOrchestrator {
    /// Creates an orchestrator with a total time budget and attempt cap.
    pub fn new(budget: Duration, max_attempts: u32) -> Self {
        Self { budget, max_attempts, error_map: None }
    }

    /// Attaches the server's error map for strategy lookup.
    pub fn with_error_map(mut self, error_map: Arc<ErrorMap>) -> Self {
        self.error_map = Some(error_map);
        self
    }

    /// Runs `op` until it succeeds, fails terminally, or the budget is
    /// spent. The closure receives the 0-based attempt number.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                tracing::debug!(attempts = attempt, error = %error, "retry attempts exhausted");
                return Err(error);
            }

            let delay = self.delay_for(&error, attempt - 1);
            if started.elapsed() + delay >= self.budget {
                tracing::debug!(elapsed = ?started.elapsed(), error = %error, "retry budget exhausted");
                return Err(error);
            }

            tracing::trace!(attempt, delay = ?delay, error = %error, "retrying operation");
            tokio::time::sleep(delay).await;
        }
    }

    /// Picks the delay before retry `attempt` (0-based).
    fn delay_for(&self, error: &ShoalError, attempt: u32) -> Duration {
        if let (Some(map), Some(status)) = (&self.error_map, error.status()) {
            if let Some(spec) = map.retry_for(status.value()) {
                return spec.delay(attempt);
            }
        }

        // NotMyVBucket means a fresher config is already on its way;
        // re-route immediately.
        if matches!(error, ShoalError::NotMyVBucket) {
            return Duration::ZERO;
        }

        DEFAULT_BASE_DELAY
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .min(DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn orchestrator() -> RetryOrchestrator {
        RetryOrchestrator::new(Duration::from_secs(2), 10)
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let calls = AtomicU32::new(0);
        let result = orchestrator()
            .execute(|_| {
                calls.fetch_add(1, Ordering::AcqRel);
                async { Ok(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = orchestrator()
            .execute(|_| {
                calls.fetch_add(1, Ordering::AcqRel);
                async { Err(ShoalError::NotFound) }
            })
            .await;
        assert!(matches!(result, Err(ShoalError::NotFound)));
        assert_eq!(calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = orchestrator()
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::AcqRel);
                async move {
                    if attempt < 3 {
                        Err(ShoalError::Temporary)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::Acquire), 4);
    }

    #[tokio::test]
    async fn test_attempt_cap() {
        let orchestrator = RetryOrchestrator::new(Duration::from_secs(30), 3);
        let calls = AtomicU32::new(0);
        let result: Result<()> = orchestrator
            .execute(|_| {
                calls.fetch_add(1, Ordering::AcqRel);
                async { Err(ShoalError::Temporary) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn test_budget_beats_schedule() {
        let orchestrator = RetryOrchestrator::new(Duration::from_millis(30), 1000);
        let started = Instant::now();
        let result: Result<()> = orchestrator
            .execute(|_| async { Err(ShoalError::Temporary) })
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_not_my_vbucket_retries_without_delay() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = orchestrator()
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::AcqRel);
                async move {
                    if attempt < 2 {
                        Err(ShoalError::NotMyVBucket)
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::Acquire), 3);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_server_strategy_respected() {
        let map: Arc<ErrorMap> = Arc::new(
            ErrorMap::parse(
                br#"{
                    "version": 1, "revision": 1,
                    "errors": {
                        "86": {
                            "name": "ETMPFAIL",
                            "retry": {"strategy": "constant", "interval": 20}
                        }
                    }
                }"#,
            )
            .unwrap(),
        );

        let orchestrator =
            RetryOrchestrator::new(Duration::from_secs(5), 4).with_error_map(map);
        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let _: Result<()> = orchestrator
            .execute(|_| {
                calls.fetch_add(1, Ordering::AcqRel);
                async { Err(ShoalError::Temporary) }
            })
            .await;

        // Three sleeps of ~20ms between four attempts.
        assert_eq!(calls.load(Ordering::Acquire), 4);
        assert!(started.elapsed() >= Duration::from_millis(55));
    }
}
