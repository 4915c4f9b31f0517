//! # LLM Propagation
//!
//! A layered, feed-forward network of LLM calls.
//!
//! Each layer holds one or more nodes. Each node renders a prompt template
//! against named inputs, calls an LLM once, and writes exactly one named
//! output into the run context. Later layers consume earlier outputs by
//! exact name. Nodes inside a layer run concurrently; layers run in order.
//!
//! ## Core Concepts
//!
//! - **[`Template`] / [`TemplateStore`]**: prompt text with `{name}` markers,
//!   the inputs it binds, and the single output key it produces.
//! - **[`GraphSpec`]**: the declarative layers/nodes description, loadable
//!   from JSON (or YAML with the `yaml` feature).
//! - **[`GraphValidator`]**: load-time check that every input resolves to a
//!   strictly earlier layer's output or the seed key, and that output keys
//!   are unique. Every problem is reported at once.
//! - **[`Pipeline`]**: the validated, executable network. A run seeds a
//!   [`RunContext`] with the query and merges each layer atomically.
//! - **[`ExecCtx`]**: runtime collaborators (HTTP client, [`Backend`],
//!   per-call timeout, cancellation, event handler).
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_propagation::{ExecCtx, LayerSpec, NodeSpec, Pipeline, Template};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::builder()
//!         .template(
//!             Template::new("reformulate", "Restate clearly: {query}", "reformulated")
//!                 .with_inputs(&["query"]),
//!         )
//!         .template(
//!             Template::new("answer", "Answer this: {reformulated}", "answer")
//!                 .with_inputs(&["reformulated"]),
//!         )
//!         .layer(
//!             LayerSpec::new("reformulation").node(NodeSpec::new("reformulator", "reformulate")),
//!         )
//!         .layer(LayerSpec::new("answering").node(NodeSpec::new("answerer", "answer")))
//!         .build()?;
//!
//!     let ctx = ExecCtx::groq().build()?;
//!     let context = pipeline.process(&ctx, "why is the sky blue").await?;
//!     println!("{}", context.get("answer").unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Loading from artifacts
//!
//! ```no_run
//! use llm_propagation::Pipeline;
//!
//! # fn main() -> llm_propagation::Result<()> {
//! let pipeline = Pipeline::from_paths("config/layers.json", "config/templates.json")?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod layer;
pub mod node;
pub mod pipeline;
pub mod template;
pub mod types;
pub mod validator;

pub use backend::{
    Backend, BackoffConfig, LlmRequest, LlmResponse, MockBackend, OpenAiBackend, RetryingBackend,
};
pub use client::{LlmConfig, ReasoningEffort};
pub use config::{GraphSpec, LayerSpec, NodeSpec, TemplateFile};
pub use error::{ConfigError, ConfigErrors, NodeFailure, PipelineError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use layer::Layer;
pub use node::Node;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use template::{LoadMode, Template, TemplateStore};
pub use types::{LayerProgress, RunContext};
pub use validator::GraphValidator;
