//! Mock backend for testing without a live LLM.
//!
//! [`MockBackend`] returns canned responses in order, or computes them from
//! the request with a responder closure. Failures and per-node latency can
//! be scripted so tests can exercise layer atomicity, cancellation and
//! timeouts deterministically.
//!
//! # Example
//!
//! ```
//! use llm_propagation::backend::MockBackend;
//!
//! let mock = MockBackend::new(vec!["Hello, world!".to_string()]);
//! let echo = MockBackend::responder(|req| Ok(format!("{}:{}", req.node_id, req.prompt)));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::PipelineError;

type ResponderFn = Arc<dyn Fn(&LlmRequest) -> Result<String> + Send + Sync>;
type ErrorFn = Arc<dyn Fn() -> PipelineError + Send + Sync>;

enum Source {
    Canned(Vec<String>),
    Responder(ResponderFn),
}

/// A test backend with canned or computed responses.
///
/// Canned responses cycle back to the beginning when exhausted.
pub struct MockBackend {
    source: Source,
    index: AtomicUsize,
    calls: AtomicUsize,
    fail_first: Option<(usize, ErrorFn)>,
    node_failures: HashMap<String, ErrorFn>,
    node_delays: HashMap<String, Duration>,
    delay: Option<Duration>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("calls", &self.calls())
            .field("failing_nodes", &self.node_failures.keys().collect::<Vec<_>>())
            .field("delayed_nodes", &self.node_delays)
            .finish()
    }
}

impl MockBackend {
    fn with_source(source: Source) -> Self {
        Self {
            source,
            index: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            fail_first: None,
            node_failures: HashMap::new(),
            node_delays: HashMap::new(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock backend with the given canned responses.
    ///
    /// Responses are returned in order. When exhausted, cycles from the beginning.
    pub fn new(responses: Vec<String>) -> Self {
        assert!(!responses.is_empty(), "MockBackend requires at least one response");
        Self::with_source(Source::Canned(responses))
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Create a mock whose response is computed from each request.
    pub fn responder(f: impl Fn(&LlmRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self::with_source(Source::Responder(Arc::new(f)))
    }

    /// Fail the first `n` calls (across all nodes) with errors built by `error`.
    pub fn fail_first(
        mut self,
        n: usize,
        error: impl Fn() -> PipelineError + Send + Sync + 'static,
    ) -> Self {
        self.fail_first = Some((n, Arc::new(error)));
        self
    }

    /// Always fail calls issued by `node_id`.
    pub fn fail_node(
        mut self,
        node_id: impl Into<String>,
        error: impl Fn() -> PipelineError + Send + Sync + 'static,
    ) -> Self {
        self.node_failures.insert(node_id.into(), Arc::new(error));
        self
    }

    /// Sleep before answering calls issued by `node_id`.
    pub fn delay_node(mut self, node_id: impl Into<String>, delay: Duration) -> Self {
        self.node_delays.insert(node_id.into(), delay);
        self
    }

    /// Sleep before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Prompts received from `node_id`.
    pub fn prompts_for(&self, node_id: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.node_id == node_id)
            .map(|r| r.prompt)
            .collect()
    }

    fn next_response(&self, request: &LlmRequest) -> Result<String> {
        match &self.source {
            Source::Canned(responses) => {
                let idx = self.index.fetch_add(1, Ordering::Relaxed) % responses.len();
                Ok(responses[idx].clone())
            }
            Source::Responder(f) => f(request),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let delay = self
            .node_delays
            .get(&request.node_id)
            .copied()
            .or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((n, error)) = &self.fail_first {
            if call < *n {
                return Err(error());
            }
        }
        if let Some(error) = self.node_failures.get(&request.node_id) {
            return Err(error());
        }

        let text = self.next_response(request)?;
        Ok(LlmResponse {
            text,
            status: 200,
            metadata: Default::default(),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
