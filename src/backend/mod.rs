//! LLM client capability consumed by the engine.
//!
//! The [`Backend`] trait is the only surface a node calls: one rendered
//! prompt plus the node's [`LlmConfig`] in, raw text out. Built-in
//! implementations: [`OpenAiBackend`] for OpenAI-compatible providers and
//! [`MockBackend`] for tests.
//!
//! ## Architecture
//!
//! ```text
//! Node ──► LlmRequest ──► Backend::complete() ──► LlmResponse
//!                                 │
//!              ┌──────────────────┼──────────────────┐
//!       RetryingBackend     OpenAiBackend        MockBackend
//!     wraps any backend  /v1/chat/completions  canned / scripted
//! ```
//!
//! Transport retry ([`BackoffConfig`]) belongs to this layer and is opt-in
//! through [`RetryingBackend`]. A node issues exactly one `complete` call.

pub mod backoff;
pub mod mock;
pub mod openai;
pub mod retrying;

pub use backoff::BackoffConfig;
pub use mock::MockBackend;
pub use openai::OpenAiBackend;
pub use retrying::RetryingBackend;

use crate::client::LlmConfig;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

/// Type alias for the callback invoked before each transport retry.
///
/// Arguments: `(attempt_number, delay_before_retry, reason_for_retry)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, std::time::Duration, &str) + Send)>;

/// A provider-agnostic LLM request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Id of the node issuing the call (for logging and test doubles).
    pub node_id: String,

    /// The fully rendered prompt text.
    pub prompt: String,

    /// The node's LLM configuration.
    pub config: LlmConfig,
}

impl LlmRequest {
    pub fn new(node_id: impl Into<String>, prompt: impl Into<String>, config: LlmConfig) -> Self {
        Self {
            node_id: node_id.into(),
            prompt: prompt.into(),
            config,
        }
    }
}

/// A normalized LLM response.
#[derive(Debug)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Provider-specific metadata (token counts, model info).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over LLM providers.
///
/// Implementors translate an [`LlmRequest`] into the provider's API and
/// return the raw text. Errors should use [`PipelineError::HttpError`] for
/// non-success statuses so callers can tell transient from permanent
/// failures via [`PipelineError::is_transient`].
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a single completion.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Check whether a [`PipelineError`] is retryable based on the backoff config.
///
/// Retryable conditions:
/// - [`PipelineError::HttpError`] with a status in `config.retryable_statuses`
/// - [`PipelineError::Request`] (connection/transport errors)
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) => true,
        _ => false,
    }
}

/// Execute a backend call with transport-level retry and exponential backoff.
///
/// Returns the first successful response, or the last error if all retries
/// are exhausted. `Retry-After` hints are honored when the config allows it.
pub async fn with_backoff(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LlmRequest,
    config: &BackoffConfig,
    cancel: Option<&std::sync::atomic::AtomicBool>,
    mut on_retry: RetryCallback<'_>,
) -> Result<LlmResponse> {
    let is_cancelled =
        || cancel.is_some_and(|flag| flag.load(std::sync::atomic::Ordering::Relaxed));
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..=config.max_retries {
        if is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if attempt > 0 {
            let delay = match &last_error {
                Some(PipelineError::HttpError {
                    retry_after: Some(ra),
                    ..
                }) if config.respect_retry_after => *ra,
                _ => config.delay_for_attempt(attempt - 1),
            };

            let reason = last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();

            tracing::debug!(
                node_id = %request.node_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "Retrying LLM call"
            );

            if let Some(ref mut cb) = on_retry {
                cb(attempt, delay, &reason);
            }

            tokio::time::sleep(delay).await;

            if is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
        }

        match backend.complete(client, base_url, request).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                if attempt < config.max_retries && is_retryable(&e, config) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error.unwrap_or(PipelineError::Other(
        "backoff loop exited unexpectedly".into(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn test_request() -> LlmRequest {
        LlmRequest::new("n", "test", LlmConfig::default())
    }

    fn http(status: u16) -> PipelineError {
        PipelineError::HttpError {
            status,
            body: String::new(),
            retry_after: None,
        }
    }

    fn fast_retries(max_retries: u32) -> BackoffConfig {
        BackoffConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            jitter: backoff::JitterStrategy::None,
            ..BackoffConfig::standard()
        }
    }

    #[test]
    fn test_is_retryable_429() {
        assert!(is_retryable(&http(429), &BackoffConfig::standard()));
    }

    #[test]
    fn test_is_retryable_400_not_retried() {
        assert!(!is_retryable(&http(400), &BackoffConfig::standard()));
    }

    #[test]
    fn test_is_retryable_cancelled_not_retried() {
        assert!(!is_retryable(&PipelineError::Cancelled, &BackoffConfig::standard()));
    }

    #[tokio::test]
    async fn test_backoff_respects_cancellation() {
        let cancel = AtomicBool::new(true);
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::fixed("unused"));

        let result = with_backoff(
            &backend,
            &Client::new(),
            "http://unused",
            &test_request(),
            &BackoffConfig::standard(),
            Some(&cancel),
            None,
        )
        .await;

        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_backoff_retries_transient_then_succeeds() {
        let mock = Arc::new(MockBackend::fixed("ok").fail_first(2, || http(503)));
        let backend: Arc<dyn Backend> = mock.clone();
        let mut attempts = Vec::new();
        let mut on_retry = |attempt: u32, _delay: Duration, _reason: &str| attempts.push(attempt);

        let response = with_backoff(
            &backend,
            &Client::new(),
            "http://unused",
            &test_request(),
            &fast_retries(3),
            None,
            Some(&mut on_retry),
        )
        .await
        .unwrap();

        assert_eq!(response.text, "ok");
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_backoff_does_not_retry_permanent() {
        let mock = Arc::new(MockBackend::fixed("ok").fail_first(1, || http(401)));
        let backend: Arc<dyn Backend> = mock.clone();

        let result = with_backoff(
            &backend,
            &Client::new(),
            "http://unused",
            &test_request(),
            &fast_retries(3),
            None,
            None,
        )
        .await;

        assert!(matches!(result, Err(PipelineError::HttpError { status: 401, .. })));
        assert_eq!(mock.calls(), 1);
    }
}
