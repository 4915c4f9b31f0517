//! Transport retry as a [`Backend`] decorator.
//!
//! [`RetryingBackend`] wraps any backend and re-issues failed calls per a
//! [`BackoffConfig`]. Nodes only ever see one `complete` call; whether that
//! call retried underneath is the client's business.

use super::{with_backoff, Backend, BackoffConfig, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// A backend that retries transient failures of an inner backend.
///
/// # Example
///
/// ```
/// use llm_propagation::backend::{BackoffConfig, OpenAiBackend, RetryingBackend};
/// use llm_propagation::ExecCtx;
/// use std::sync::Arc;
///
/// # fn main() -> llm_propagation::Result<()> {
/// let backend = RetryingBackend::new(Arc::new(OpenAiBackend::new()), BackoffConfig::standard());
/// let ctx = ExecCtx::builder("http://localhost:8000")
///     .backend(Arc::new(backend))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    config: BackoffConfig,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, config: BackoffConfig) -> Self {
        Self {
            inner,
            config,
            cancellation: None,
            event_handler: None,
        }
    }

    /// Stop retrying once `flag` is set.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }

    /// Report each retry as [`Event::TransportRetry`].
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }
}

impl std::fmt::Debug for RetryingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingBackend")
            .field("inner", &self.inner.name())
            .field("config", &self.config)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let mut on_retry = |attempt: u32, delay: std::time::Duration, reason: &str| {
            emit(
                &self.event_handler,
                Event::TransportRetry {
                    node_id: request.node_id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: reason.to_string(),
                },
            );
        };

        with_backoff(
            &self.inner,
            client,
            base_url,
            request,
            &self.config,
            self.cancellation.as_deref(),
            Some(&mut on_retry),
        )
        .await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
