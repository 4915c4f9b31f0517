use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Reasoning-effort tier forwarded to providers that support it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    /// Leave the provider's own default in place.
    #[default]
    Default,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Default => "default",
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a node's LLM requests.
///
/// Only the LLM client reads these values; the engine never branches on them.
/// Keys the engine does not recognize are kept in [`extra`](Self::extra) and
/// forwarded to the provider verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier (e.g. `"openai/gpt-oss-20b"`).
    #[serde(default = "default_model")]
    pub model: String,

    /// Temperature (0.0 = deterministic, 2.0 = maximum).
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Provider-specific options merged into the request body.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_model() -> String {
    "openai/gpt-oss-20b".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            reasoning_effort: ReasoningEffort::Default,
            top_p: None,
            extra: Map::new(),
        }
    }
}

impl LlmConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = effort;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Add a provider-specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Check value ranges. Returns a human-readable reason on failure.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!("temperature {} not in [0.0, 2.0]", self.temperature));
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be > 0".to_string());
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(format!("top_p {} not in [0.0, 1.0]", top_p));
            }
        }
        Ok(())
    }
}
