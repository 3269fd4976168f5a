use std::future::Future;
use std::time::Duration;

use crate::provider::ProviderError;

/// Backoff delays never grow past this.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Limit on a single attempt. Hitting it counts as a transient failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: MAX_DELAY,
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: MAX_DELAY,
            attempt_timeout,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails permanently, or the attempt budget
    /// is spent. Returns the last error together with the attempts made.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        mut f: F,
    ) -> Result<(T, u32), (ProviderError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.attempt_timeout)),
            };

            match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !e.is_transient() => {
                    tracing::error!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %e,
                        "Permanent failure, not retrying"
                    );
                    return Err((e, attempt));
                }
                Err(e) => {
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "All retry attempts exhausted"
                        );
                        return Err((e, attempt));
                    }

                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_secs(5))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(20), MAX_DELAY);
        assert_eq!(policy.delay_for(64), MAX_DELAY);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = quick(5)
            .run("create net", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::Network("connection reset".into()))
                    } else {
                        Ok("vpc-1")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(("vpc-1", 3)));
    }

    #[tokio::test]
    async fn attempt_budget_is_respected() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> = quick(3)
            .run("create net", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::RateLimited("throttled".into())) }
            })
            .await;
        assert_eq!(
            result,
            Err((ProviderError::RateLimited("throttled".into()), 3))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> = quick(5)
            .run("update vm", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Validation("bad size".into())) }
            })
            .await;
        assert_eq!(result, Err((ProviderError::Validation("bad size".into()), 1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_transient_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(20));
        let calls = AtomicU32::new(0);
        let result = policy
            .run("create db", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, ProviderError>(n)
                }
            })
            .await;
        assert_eq!(result, Ok((1, 2)));
    }

    #[tokio::test]
    async fn sub_second_timeout_is_reported_in_millis() {
        let policy = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(50));
        let result = policy
            .run("create db", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ProviderError>(())
            })
            .await;
        let (err, attempts) = result.unwrap_err();
        assert_eq!(attempts, 1);
        assert_eq!(err, ProviderError::Timeout(Duration::from_millis(50)));
        assert_eq!(err.to_string(), "operation timed out after 50ms");
    }
}
