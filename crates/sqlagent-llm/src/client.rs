use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlagent_types::AgentError;

use crate::provider::complete_with_retry;
use crate::{ProviderAdapter, Request, Response, RetryPolicy};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Hooks run around every completion, in registration order.
pub trait Middleware: Send + Sync {
    fn before(&self, _request: &mut Request) {}
    fn after(&self, _request: &Request, _response: &mut Response) {}
}

/// Logs each request and response at `info`.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &mut Request) {
        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        tracing::info!(
            model = %request.model,
            prompt_chars,
            format = ?request.response_format,
            "LLM request"
        );
    }

    fn after(&self, _request: &Request, response: &mut Response) {
        tracing::info!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            finish = ?response.finish_reason,
            "LLM response"
        );
    }
}

/// Accumulates token usage across a run. Clones share the same counters.
#[derive(Clone, Default)]
pub struct CostTrackingMiddleware {
    input: Arc<AtomicU64>,
    output: Arc<AtomicU64>,
}

impl CostTrackingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.input.load(Ordering::Relaxed)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.output.load(Ordering::Relaxed)
    }
}

impl Middleware for CostTrackingMiddleware {
    fn after(&self, _request: &Request, response: &mut Response) {
        self.input
            .fetch_add(response.usage.input_tokens, Ordering::Relaxed);
        self.output
            .fetch_add(response.usage.output_tokens, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// Routes requests to registered providers and runs the middleware chain.
///
/// A request names its provider explicitly (by name or alias); otherwise it
/// goes to the first provider registered.
pub struct LlmClient {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    aliases: HashMap<String, String>,
    default_provider: Option<String>,
    middleware: Vec<Box<dyn Middleware>>,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            aliases: HashMap::new(),
            default_provider: None,
            middleware: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn register_provider(&mut self, provider: impl ProviderAdapter + 'static) {
        let name = provider.name().to_string();
        for alias in provider.aliases() {
            self.aliases.insert((*alias).to_string(), name.clone());
        }
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, Arc::new(provider));
    }

    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Default model of the provider a request without a model would reach.
    pub fn default_model(&self, provider: Option<&str>) -> Option<&str> {
        self.lookup(provider).ok().map(|p| p.default_model())
    }

    pub async fn complete(&self, request: &Request) -> Result<Response, AgentError> {
        let provider = self.lookup(request.provider.as_deref())?;
        let mut req = request.clone();
        if req.model.is_empty() {
            req.model = provider.default_model().to_string();
        }
        if req.response_format == crate::ResponseFormat::Json && !provider.supports_json_output() {
            tracing::debug!(provider = provider.name(), "JSON output not enforced by provider");
        }

        for m in &self.middleware {
            m.before(&mut req);
        }

        let mut resp = complete_with_retry(&**provider, &req, &self.retry).await?;

        for m in &self.middleware {
            m.after(&req, &mut resp);
        }

        Ok(resp)
    }

    fn lookup(&self, name: Option<&str>) -> Result<&Arc<dyn ProviderAdapter>, AgentError> {
        let name = match name {
            Some(name) => self.aliases.get(name).map(String::as_str).unwrap_or(name),
            None => self
                .default_provider
                .as_deref()
                .ok_or_else(|| AgentError::Config("No LLM providers registered".into()))?,
        };
        self.providers
            .get(name)
            .ok_or_else(|| AgentError::Config(format!("LLM provider '{name}' not registered")))
    }

    /// Create a client for a named provider, reading its credentials from the environment.
    pub fn for_provider(name: &str) -> Result<Self, AgentError> {
        let mut client = Self::new();
        match name {
            "gemini" | "google" => client.register_provider(crate::GeminiAdapter::from_env()?),
            other => {
                return Err(AgentError::Config(format!("Unknown LLM provider: {other}")));
            }
        }
        Ok(client)
    }
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
