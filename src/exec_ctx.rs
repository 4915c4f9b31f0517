//! Execution context shared by every node call in a run.
//!
//! [`ExecCtx`] carries the HTTP client, LLM backend, endpoint, per-call
//! timeout, cancellation handle, and optional event handler. Build it once
//! and pass it to every [`Pipeline::process`](crate::Pipeline::process) call;
//! it holds no per-run state.

use crate::backend::{Backend, BackoffConfig, OpenAiBackend, RetryingBackend};
use crate::events::EventHandler;
use reqwest::Client;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Base URL of Groq's OpenAI-compatible endpoint.
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai";

/// Environment variable read by [`ExecCtx::groq`] for the API key.
pub const GROQ_API_KEY_VAR: &str = "GROQ_API_KEY";

/// Default bound on a single LLM call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared execution context for node invocations.
///
/// # Example
///
/// ```
/// use llm_propagation::ExecCtx;
/// use std::time::Duration;
///
/// # fn main() -> llm_propagation::Result<()> {
/// let ctx = ExecCtx::builder("http://localhost:8000/v1")
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// assert_eq!(ctx.base_url, "http://localhost:8000");
/// # Ok(())
/// # }
/// ```
pub struct ExecCtx {
    /// HTTP client (cheap to clone -- uses `Arc` internally).
    pub client: Client,
    /// Base URL for the LLM provider, without the `/v1/...` path.
    pub base_url: String,
    /// LLM backend. Default: [`OpenAiBackend`].
    pub backend: Arc<dyn Backend>,
    /// Upper bound on one node's LLM call.
    pub timeout: Duration,
    /// Optional cancellation flag; nodes check it before calling out.
    pub cancellation: Option<Arc<AtomicBool>>,
    /// Optional event handler for lifecycle events.
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl ExecCtx {
    /// Create a new builder.
    pub fn builder(base_url: impl Into<String>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            cancellation: None,
            event_handler: None,
            timeout: None,
        }
    }

    /// Builder preset for Groq, keyed from `GROQ_API_KEY` when set.
    ///
    /// The client retries rate limits and 5xx with [`BackoffConfig::standard()`].
    pub fn groq() -> ExecCtxBuilder {
        let client = RetryingBackend::new(
            Arc::new(OpenAiBackend::from_env(GROQ_API_KEY_VAR)),
            BackoffConfig::standard(),
        );
        Self::builder(GROQ_BASE_URL).backend(Arc::new(client))
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Return an error if cancellation has been requested.
    pub fn check_cancelled(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            return Err(crate::PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Get a reference to the cancellation AtomicBool, if set.
    pub fn cancel_flag(&self) -> Option<&AtomicBool> {
        self.cancellation.as_deref()
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    timeout: Option<Duration>,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the LLM backend. Default: [`OpenAiBackend`] without a key.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the OpenAI-compatible backend with API key authentication.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(OpenAiBackend::new().with_api_key(api_key)));
        self
    }

    /// Set the cancellation flag.
    pub fn cancellation(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancellation = cancel;
        self
    }

    /// Set the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Set the per-call timeout. Default: 60 seconds.
    ///
    /// The bound is enforced around each node's call, so it applies to any
    /// backend, including custom clients and test doubles.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the execution context.
    ///
    /// Fails only when no client was supplied and the default one cannot be
    /// constructed (for example, when no TLS backend is available).
    pub fn build(self) -> crate::error::Result<ExecCtx> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder().build()?,
        };
        Ok(ExecCtx {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(OpenAiBackend::new())),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            cancellation: self.cancellation,
            event_handler: self.event_handler,
        })
    }
}

/// Strip known provider path suffixes from a base URL.
/// e.g., "https://api.groq.com/openai/v1" -> "https://api.groq.com/openai"
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    // Longest first
    for suffix in &["/v1/chat/completions", "/v1/chat", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url_strips_v1() {
        assert_eq!(normalize_base_url("https://api.groq.com/openai/v1"), GROQ_BASE_URL);
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com");
    }

    #[test]
    fn test_normalize_base_url_preserves_clean() {
        assert_eq!(normalize_base_url("http://localhost:8000"), "http://localhost:8000");
        assert_eq!(normalize_base_url(GROQ_BASE_URL), GROQ_BASE_URL);
    }

    #[test]
    fn test_normalize_base_url_strips_full_path() {
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com"
        );
    }

    #[test]
    fn test_builder_defaults() {
        let ctx = ExecCtx::builder("http://localhost:8000/").build().unwrap();
        assert_eq!(ctx.base_url, "http://localhost:8000");
        assert_eq!(ctx.backend.name(), "openai");
        assert_eq!(ctx.timeout, DEFAULT_TIMEOUT);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_cancellation_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = ExecCtx::builder("http://localhost:8000")
            .cancellation(Some(flag.clone()))
            .build()
            .unwrap();
        assert!(ctx.check_cancelled().is_ok());
        flag.store(true, Ordering::Relaxed);
        assert!(matches!(ctx.check_cancelled(), Err(crate::PipelineError::Cancelled)));
    }

    #[test]
    fn test_groq_preset() {
        let ctx = ExecCtx::groq().timeout(Duration::from_secs(5)).build().unwrap();
        assert_eq!(ctx.base_url, GROQ_BASE_URL);
        assert_eq!(ctx.backend.name(), "openai");
        assert_eq!(ctx.timeout, Duration::from_secs(5));
    }
}
