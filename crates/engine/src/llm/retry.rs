use std::future::Future;
use std::time::Duration;

use super::context::CallContext;
use super::LlmError;

/// Upper bound on the retry budget.
pub const MAX_RETRIES_CAP: u32 = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff for transient backend failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// `max_retries` is clamped to `0..=3`; a zero `base_delay` means the default.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.min(MAX_RETRIES_CAP),
            base_delay: if base_delay.is_zero() {
                DEFAULT_BASE_DELAY
            } else {
                base_delay
            },
        }
    }

    pub fn from_config(max_retries: Option<u32>, base_delay_ms: Option<u64>) -> Self {
        Self::new(
            max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            Duration::from_millis(base_delay_ms.unwrap_or(0)),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay before retry `attempt` (0-indexed): `base * 2^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `operation` until it succeeds, fails fatally, or the budget is spent.
    ///
    /// Up to `max_retries + 1` tries. The sleep between tries aborts as soon
    /// as `ctx` is cancelled or past its deadline, returning that error.
    pub async fn run<F, Fut, T>(
        &self,
        ctx: &CallContext,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0u32;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            "LLM call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&err) || attempt >= self.max_retries {
                return Err(err);
            }
            if let Some(ctx_err) = ctx.error() {
                return Err(ctx_err);
            }

            let wait = self.delay_for_attempt(attempt);
            tracing::warn!(
                operation = operation_name,
                attempt,
                max_retries = self.max_retries,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "LLM API error, retrying"
            );
            metrics::counter!("llm.api.retries", "operation" => operation_name.to_string())
                .increment(1);

            sleep(ctx, wait).await?;
            attempt += 1;
        }
    }
}

/// Whether an error is transient: 5xx responses and timeouts.
pub fn is_retryable(error: &LlmError) -> bool {
    match error {
        LlmError::Api(api) => (500..=599).contains(&api.status),
        LlmError::Timeout(_) | LlmError::DeadlineExceeded => true,
        _ => false,
    }
}

/// Sleep for `delay`, returning early with the context error if `ctx` ends.
pub async fn sleep(ctx: &CallContext, delay: Duration) -> Result<(), LlmError> {
    if delay.is_zero() {
        return Ok(());
    }

    tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_metrics::CapturingRecorder;
    use crate::llm::ApiError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn api_error(status: u16) -> LlmError {
        LlmError::Api(ApiError {
            status,
            ..ApiError::default()
        })
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_budget_clamped_and_zero_delay_defaults() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.base_delay(), DEFAULT_BASE_DELAY);

        let policy = RetryPolicy::from_config(Some(0), None);
        assert_eq!(policy.max_retries(), 0);
        assert_eq!(policy.base_delay(), DEFAULT_BASE_DELAY);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&api_error(500)));
        assert!(is_retryable(&api_error(503)));
        assert!(is_retryable(&api_error(599)));
        assert!(is_retryable(&LlmError::Timeout("read timed out".into())));
        assert!(is_retryable(&LlmError::DeadlineExceeded));

        assert!(!is_retryable(&api_error(400)));
        assert!(!is_retryable(&api_error(429)));
        assert!(!is_retryable(&api_error(600)));
        assert!(!is_retryable(&LlmError::Http("connection refused".into())));
        assert!(!is_retryable(&LlmError::Parse("bad json".into())));
        assert!(!is_retryable(&LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CallContext::new();

        let result = fast_policy(3)
            .run(&ctx, "test", || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(api_error(500))
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
    async fn test_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CallContext::new();

        let result: Result<(), _> = fast_policy(2)
            .run(&ctx, "test", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(api_error(502))
                }
            })
            .await;

        match result {
            Err(LlmError::Api(api)) => assert_eq!(api.status, 502),
            other => panic!("Expected API error, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CallContext::new();

        let result: Result<(), _> = fast_policy(3)
            .run(&ctx, "test", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(api_error(400))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_before_next_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CallContext::new();
        let canceller = ctx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), _> = RetryPolicy::new(3, Duration::from_secs(30))
            .run(&ctx, "test", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(api_error(503))
                }
            })
            .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_expired_context_is_not_counted_as_retry() {
        let recorder = CapturingRecorder::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = recorder.run(async {
            let ctx = CallContext::new().with_timeout(Duration::ZERO);
            fast_policy(3)
                .run(&ctx, "test", || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(LlmError::DeadlineExceeded)
                    }
                })
                .await
        });

        assert!(matches!(result, Err(LlmError::DeadlineExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(recorder.samples("llm.api.retries").is_empty());
    }

    #[test]
    fn test_retries_are_counted() {
        let recorder = CapturingRecorder::default();

        let result: Result<(), _> = recorder.run(async {
            fast_policy(2)
                .run(&CallContext::new(), "test", || async { Err(api_error(500)) })
                .await
        });

        assert!(result.is_err());
        assert_eq!(recorder.samples("llm.api.retries"), vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_zero_delay_sleep_is_noop() {
        let ctx = CallContext::new();
        ctx.cancel();
        assert!(sleep(&ctx, Duration::ZERO).await.is_ok());
        assert!(matches!(
            sleep(&ctx, Duration::from_millis(5)).await,
            Err(LlmError::Cancelled)
        ));
    }
}
