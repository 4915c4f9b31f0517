//! Backend for OpenAI-compatible chat completion APIs.
//!
//! [`OpenAiBackend`] covers Groq, OpenAI, vLLM, llama.cpp server, LM Studio,
//! Together AI and any other provider exposing `/v1/chat/completions`.
//!
//! Each node call is one user message carrying the rendered prompt.

use super::{Backend, LlmRequest, LlmResponse};
use crate::client::ReasoningEffort;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use llm_propagation::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new();
/// let with_key = OpenAiBackend::new().with_api_key("gsk-...");
/// ```
#[derive(Clone)]
pub struct OpenAiBackend {
    /// Optional API key. If set, sent as `Authorization: Bearer {key}`.
    pub(crate) api_key: Option<String>,
    /// Optional organization ID. If set, sent as `OpenAI-Organization: {org}`.
    pub(crate) organization: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| match k.get(..6) {
                    Some(prefix) if k.len() > 6 => format!("{}***", prefix),
                    _ => "***".to_string(),
                }),
            )
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiBackend {
    /// Create a new backend without authentication.
    pub fn new() -> Self {
        Self {
            api_key: None,
            organization: None,
        }
    }

    /// Create a backend keyed from an environment variable, if it is set.
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => Self::new().with_api_key(key),
            _ => Self::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Build the request body for `/v1/chat/completions`.
    fn build_body(request: &LlmRequest) -> Value {
        let config = &request.config;
        let mut body = json!({
            "model": config.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "stream": false,
        });

        if let Some(top_p) = config.top_p {
            body["top_p"] = json!(top_p);
        }
        if config.reasoning_effort != ReasoningEffort::Default {
            body["reasoning_effort"] = json!(config.reasoning_effort.as_str());
        }
        // Qwen models on Groq stream their reasoning inline unless hidden.
        if config.model.starts_with("qwen/") {
            body["reasoning_format"] = json!("hidden");
        }

        if let Value::Object(ref mut map) = body {
            for (key, value) in &config.extra {
                map.insert(key.clone(), value.clone());
            }
        }

        body
    }

    /// Parse a `Retry-After` header value as seconds.
    fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
        value
            .trim()
            .parse::<u64>()
            .ok()
            .map(std::time::Duration::from_secs)
    }

    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);

        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }

        req
    }

    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in ["usage", "model", "id"] {
            if let Some(v) = json_resp.get(key) {
                meta.insert(key.into(), v.clone());
            }
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }

    /// The assistant text of the first choice.
    ///
    /// A success status without it is an error, never an empty output.
    fn extract_text(json_resp: &Value) -> Result<String> {
        json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Other("response has no choices[0].message.content".into())
            })
    }
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let base = base_url.trim_end_matches('/');
        let url = format!("{}/v1/chat/completions", base);
        let body = Self::build_body(request);

        tracing::trace!(
            node_id = %request.node_id,
            model = %request.config.model,
            %url,
            "Sending completion request"
        );

        let resp = self.build_http_request(client, &url, &body).send().await?;
        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::HttpError {
                status,
                body: text,
                retry_after,
            });
        }

        let json_resp: Value = resp.json().await?;
        let text = Self::extract_text(&json_resp).inspect_err(|e| {
            tracing::error!(node_id = %request.node_id, status, error = %e, "Malformed completion");
        })?;

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
