//! Retrying model client.
//!
//! Wraps any [`LlmProvider`] with a per-attempt timeout, bounded retries with
//! exponential backoff, and a semaphore limiting in-flight backend calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::litellm::{GenerationRequest, LlmProvider, Usage};
use crate::error::{ExhaustedRetries, ModelError};

/// Retry and timeout settings for model calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Maximum wait for a single attempt.
    pub call_timeout: Duration,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            call_timeout: Duration::from_secs(120),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given retry count and default timings.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Sets the per-attempt timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the base and maximum backoff delays.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// A successful model completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Wall-clock time across all attempts and backoff.
    pub latency: Duration,
    /// Token usage reported by the backend for the successful attempt.
    pub usage: Usage,
}

/// Uniform "prompt in, completion out" capability used by every agent.
#[derive(Clone)]
pub struct ModelClient {
    provider: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    limiter: Arc<Semaphore>,
}

impl ModelClient {
    /// Creates a client allowing at most `max_in_flight` concurrent backend calls.
    pub fn new(provider: Arc<dyn LlmProvider>, policy: RetryPolicy, max_in_flight: usize) -> Self {
        Self {
            provider,
            policy,
            limiter: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submits a request, retrying failed attempts with exponential backoff.
    ///
    /// Never substitutes content: after `max_retries + 1` failed attempts the
    /// last error is returned together with the attempt count.
    pub async fn complete(&self, request: GenerationRequest) -> Result<Completion, ExhaustedRetries> {
        let started = Instant::now();
        let max_attempts = self.policy.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.policy.backoff_delay(attempt - 1);
                debug!(
                    model = %request.model,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying model call after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt(request.clone()).await {
                Ok((text, usage)) => {
                    return Ok(Completion {
                        text,
                        attempts: attempt,
                        latency: started.elapsed(),
                        usage,
                    });
                }
                Err(err) => {
                    warn!(
                        model = %request.model,
                        attempt,
                        max_attempts,
                        kind = err.kind(),
                        error = %err,
                        "Model call attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(ExhaustedRetries {
            attempts: max_attempts,
            last_error: last_error.unwrap_or_else(|| {
                ModelError::ConnectionError("No attempt was made".to_string())
            }),
            elapsed: started.elapsed(),
        })
    }

    /// One bounded attempt: waits for a concurrency permit, then for the backend.
    async fn attempt(&self, request: GenerationRequest) -> Result<(String, Usage), ModelError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| ModelError::ConnectionError(format!("Limiter closed: {}", e)))?;

        let millis = self.policy.call_timeout.as_millis() as u64;
        let response = tokio::time::timeout(self.policy.call_timeout, self.provider.generate(request))
            .await
            .map_err(|_| ModelError::Timeout { millis })??;

        let text = response
            .first_content()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ModelError::MalformedResponse("Empty completion".to_string()))?
            .to_string();

        Ok((text, response.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, GenerationResponse, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then answers.
    struct FlakyProvider {
        failures: u32,
        error: ModelError,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(failures: u32, error: ModelError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            Ok(GenerationResponse {
                id: format!("mock-{}", n),
                model: "mock".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant("  an answer  "),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, ModelError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ModelError::ConnectionError("unreachable".into()))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries).with_backoff(Duration::ZERO, Duration::ZERO)
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("mock", vec![Message::user("hi")])
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_always_failing_provider_gets_max_retries_plus_one_attempts() {
        let provider = Arc::new(FlakyProvider::new(
            u32::MAX,
            ModelError::ConnectionError("refused".into()),
        ));
        let client = ModelClient::new(provider.clone(), fast_policy(3), 1);

        let err = client.complete(request()).await.expect_err("must fail");

        assert_eq!(err.attempts, 4);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err.last_error, ModelError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let provider = Arc::new(FlakyProvider::new(
            u32::MAX,
            ModelError::RateLimited("429".into()),
        ));
        let client = ModelClient::new(provider.clone(), fast_policy(0), 1);

        let err = client.complete(request()).await.expect_err("must fail");
        assert_eq!(err.attempts, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let provider = Arc::new(FlakyProvider::new(
            2,
            ModelError::MalformedResponse("garbled".into()),
        ));
        let client = ModelClient::new(provider, fast_policy(2), 1);

        let completion = client.complete(request()).await.expect("third attempt succeeds");
        assert_eq!(completion.attempts, 3);
        assert_eq!(completion.text, "an answer");
        assert_eq!(completion.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_call_timeout_is_enforced() {
        let policy = fast_policy(1).with_call_timeout(Duration::from_millis(20));
        let client = ModelClient::new(Arc::new(SlowProvider), policy, 1);

        let err = client.complete(request()).await.expect_err("must time out");
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_error, ModelError::Timeout { millis: 20 });
        assert_eq!(
            err.last_error.to_string(),
            "Model call timed out after 20 ms"
        );
        assert!(err.elapsed >= Duration::from_millis(40));
    }
}
