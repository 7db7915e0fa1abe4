//! LLM client used by the SQL agent.
//!
//! Provides the `ProviderAdapter` trait, a retry policy for transient provider
//! errors, the middleware chain, and `LlmClient` for routing requests by provider.

#[cfg(feature = "providers")]
mod client;
#[cfg(feature = "providers")]
mod gemini;
#[cfg(feature = "providers")]
mod provider;
mod types;

#[cfg(feature = "providers")]
pub use client::*;
#[cfg(feature = "providers")]
pub use gemini::GeminiAdapter;
#[cfg(feature = "providers")]
pub use provider::*;
pub use types::*;
