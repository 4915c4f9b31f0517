use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing failed at the serde level.
    #[cfg(feature = "yaml")]
    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Reading a configuration artifact failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The graph description failed load-time validation.
    #[error("{0}")]
    Config(#[from] ConfigErrors),

    /// A node's prompt could not be fully rendered.
    ///
    /// Validation guarantees every `input_context` key is present before a
    /// layer runs, so this signals an internal consistency failure.
    #[error("Node '{node_id}' could not render template '{template_id}': missing '{missing}'")]
    Render {
        node_id: String,
        template_id: String,
        missing: String,
    },

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code. The `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// An LLM call did not finish within the configured timeout.
    #[error("Node '{node_id}' timed out after {after:?}")]
    Timeout { node_id: String, after: Duration },

    /// One or more nodes in a layer failed; none of the layer's outputs were kept.
    #[error("Layer {layer_index} ('{layer_id}') failed: {}", format_failures(.failures))]
    LayerFailed {
        layer_index: usize,
        layer_id: String,
        failures: Vec<NodeFailure>,
    },

    /// No designated final output could be selected for the run.
    #[error("No final output: {0}")]
    NoFinalOutput(String),

    /// The run was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Invalid runtime configuration detected outside graph validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Whether a caller may reasonably retry the operation that produced this error.
    ///
    /// Timeouts, rate limits, server errors and transport failures are
    /// transient. A layer failure is transient only when every node failure
    /// inside it is.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Timeout { .. } => true,
            PipelineError::Request(e) => !e.is_builder() && !e.is_decode(),
            PipelineError::HttpError { status, .. } => {
                matches!(*status, 408 | 425 | 429) || (500..=599).contains(status)
            }
            PipelineError::LayerFailed { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_transient())
            }
            _ => false,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A single node's failure inside a layer.
#[derive(Debug)]
pub struct NodeFailure {
    pub node_id: String,
    pub error: PipelineError,
}

fn format_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("node '{}': {}", f.node_id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One structural problem found while validating a graph description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Pipeline must have at least one layer")]
    EmptyPipeline,

    #[error("Layer '{layer_id}' has no nodes")]
    EmptyLayer { layer_id: String },

    #[error("Duplicate layer id '{layer_id}'")]
    DuplicateLayerId { layer_id: String },

    #[error("Duplicate node id '{node_id}'")]
    DuplicateNodeId { node_id: String },

    #[error("Seed key '{value}' must match ^[a-z0-9_]+$")]
    InvalidSeedKey { value: String },

    #[error("Template '{template_id}' not found")]
    TemplateNotFound { template_id: String },

    #[error("Node '{node_id}' in layer {layer_index} references missing template '{template_id}'")]
    MissingTemplate {
        node_id: String,
        layer_index: usize,
        template_id: String,
    },

    #[error("Template '{template_id}' expected_output '{value}' must match ^[a-z0-9_]+$")]
    InvalidOutputName { template_id: String, value: String },

    #[error("Template '{template_id}' expected_output '{value}' collides with the seed key")]
    ReservedOutput { template_id: String, value: String },

    #[error("Output '{duplicate_key}' produced more than once (templates {template_ids:?}, nodes {node_ids:?})")]
    DuplicateOutput {
        duplicate_key: String,
        template_ids: Vec<String>,
        node_ids: Vec<String>,
    },

    #[error("Template '{template_id}' placeholder '{placeholder}' not found in template text")]
    PlaceholderNotInContent {
        template_id: String,
        placeholder: String,
    },

    #[error("Template '{template_id}' input_context entry '{name}' is not a declared placeholder")]
    UndeclaredInput { template_id: String, name: String },

    #[error("Template '{template_id}' contains marker '{{{marker}}}' that input_context does not bind")]
    UndeclaredMarker { template_id: String, marker: String },

    #[error(
        "Node '{node_id}' in layer {layer_index} (template '{template_id}') needs '{missing_placeholder}', \
         available outputs: {available_outputs:?}"
    )]
    UnresolvedPlaceholder {
        node_id: String,
        layer_index: usize,
        template_id: String,
        missing_placeholder: String,
        available_outputs: Vec<String>,
    },

    #[error("Node '{node_id}' declares expected_output '{declared}' but its template produces '{template_output}'")]
    OutputMismatch {
        node_id: String,
        declared: String,
        template_output: String,
    },

    #[error("Node '{node_id}' has invalid llm_config: {reason}")]
    InvalidLlmConfig { node_id: String, reason: String },

    #[error("Final output '{key}' is not produced by any layer")]
    UnknownFinalOutput { key: String },
}

/// Every problem found during one validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl ConfigErrors {
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid pipeline configuration ({} problem(s))", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n  - {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

impl From<ConfigError> for ConfigErrors {
    fn from(err: ConfigError) -> Self {
        ConfigErrors(vec![err])
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> PipelineError {
        PipelineError::HttpError {
            status,
            body: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(http(429).is_transient());
        assert!(http(503).is_transient());
        assert!(!http(401).is_transient());
        assert!(!http(400).is_transient());
        assert!(PipelineError::Timeout {
            node_id: "n".into(),
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
    }

    #[test]
    fn test_layer_failure_transient_only_if_all_are() {
        let mixed = PipelineError::LayerFailed {
            layer_index: 0,
            layer_id: "l".into(),
            failures: vec![
                NodeFailure {
                    node_id: "a".into(),
                    error: http(429),
                },
                NodeFailure {
                    node_id: "b".into(),
                    error: http(401),
                },
            ],
        };
        assert!(!mixed.is_transient());

        let transient = PipelineError::LayerFailed {
            layer_index: 0,
            layer_id: "l".into(),
            failures: vec![NodeFailure {
                node_id: "a".into(),
                error: http(502),
            }],
        };
        assert!(transient.is_transient());
    }

    #[test]
    fn test_layer_failure_message_names_every_node() {
        let err = PipelineError::LayerFailed {
            layer_index: 2,
            layer_id: "synthesis".into(),
            failures: vec![
                NodeFailure {
                    node_id: "a".into(),
                    error: http(500),
                },
                NodeFailure {
                    node_id: "b".into(),
                    error: PipelineError::Cancelled,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Layer 2 ('synthesis')"));
        assert!(msg.contains("node 'a'"));
        assert!(msg.contains("node 'b'"));
    }

    #[test]
    fn test_config_errors_display_lists_all() {
        let errs = ConfigErrors(vec![
            ConfigError::EmptyLayer {
                layer_id: "l1".into(),
            },
            ConfigError::DuplicateNodeId {
                node_id: "n".into(),
            },
        ]);
        let msg = errs.to_string();
        assert!(msg.contains("2 problem(s)"));
        assert!(msg.contains("Layer 'l1' has no nodes"));
        assert!(msg.contains("Duplicate node id 'n'"));
    }
}
