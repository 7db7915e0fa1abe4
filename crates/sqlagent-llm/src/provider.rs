use std::time::Duration;

use async_trait::async_trait;

use crate::{Request, Response};
use sqlagent_types::AgentError;

/// A language-model backend the client can route requests to.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(&self, request: &Request) -> Result<Response, AgentError>;

    /// Registry key, e.g. `"google"`.
    fn name(&self) -> &str;

    /// Other names the provider answers to (`"gemini"` for Google).
    fn aliases(&self) -> &[&'static str] {
        &[]
    }

    fn default_model(&self) -> &str;

    /// Whether `ResponseFormat::Json` is enforced server-side.
    fn supports_json_output(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// How often, and how patiently, transient provider errors are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed): base * 2^attempt, capped.
    ///
    /// A rate-limit hint from the provider wins when it is longer.
    pub fn delay_for(&self, attempt: u32, error: &AgentError) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        match error {
            AgentError::RateLimited { retry_after_ms, .. } => {
                backoff.max(Duration::from_millis(*retry_after_ms).min(self.max_delay))
            }
            _ => backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Call `provider` until it succeeds, fails permanently, or retries run out.
pub(crate) async fn complete_with_retry(
    provider: &dyn ProviderAdapter,
    request: &Request,
    policy: &RetryPolicy,
) -> Result<Response, AgentError> {
    let mut attempt = 0;
    loop {
        match provider.complete(request).await {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, &e);
                tracing::warn!(
                    provider = provider.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable provider error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
