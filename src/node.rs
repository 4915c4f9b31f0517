//! A single LLM call inside a layer.
//!
//! A [`Node`] binds one template to one [`LlmConfig`]. When its layer runs,
//! the node selects exactly its template's `input_context` entries from the
//! run context, renders the prompt, calls the backend once, and returns the
//! raw response text. The text is written under the template's
//! `expected_output` key by the layer, never by the node.

use crate::{
    backend::LlmRequest,
    client::LlmConfig,
    config::NodeSpec,
    error::Result,
    events::{emit, Event},
    exec_ctx::ExecCtx,
    template::Template,
    types::RunContext,
    PipelineError,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A configured LLM call.
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    name: Option<String>,
    description: Option<String>,
    template: Arc<Template>,
    llm_config: LlmConfig,
}

impl Node {
    pub fn new(id: impl Into<String>, template: Arc<Template>, llm_config: LlmConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            template,
            llm_config,
        }
    }

    /// Build a node from its description and already-resolved template.
    pub(crate) fn from_spec(spec: &NodeSpec, template: Arc<Template>) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            template,
            llm_config: spec.llm_config.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn template_id(&self) -> &str {
        &self.template.id
    }

    pub fn llm_config(&self) -> &LlmConfig {
        &self.llm_config
    }

    /// The context key this node's response is stored under.
    pub fn output_key(&self) -> &str {
        &self.template.expected_output
    }

    /// Entries of `context` named by the template's `input_context`.
    ///
    /// Keys absent from the context are skipped; rendering reports them.
    pub fn select_inputs<'a>(&'a self, context: &'a RunContext) -> BTreeMap<&'a str, &'a str> {
        self.template
            .input_context
            .iter()
            .filter_map(|name| context.get(name).map(|value| (name.as_str(), value)))
            .collect()
    }

    /// Render the prompt from the selected inputs.
    pub fn render(&self, context: &RunContext) -> Result<String> {
        let inputs = self.select_inputs(context);
        self.template.render(&inputs).map_err(|missing| {
            tracing::error!(
                node_id = %self.id,
                template_id = %self.template.id,
                %missing,
                "Prompt rendering failed"
            );
            PipelineError::Render {
                node_id: self.id.clone(),
                template_id: self.template.id.clone(),
                missing,
            }
        })
    }

    /// Render, call the backend, and return the raw response text.
    ///
    /// Exactly one `complete` call is issued, bounded by `ctx.timeout`. A
    /// failure is returned as-is; retrying is up to the backend.
    pub async fn process(
        &self,
        ctx: &ExecCtx,
        context: &RunContext,
        layer_index: usize,
    ) -> Result<String> {
        ctx.check_cancelled()?;

        emit(
            &ctx.event_handler,
            Event::NodeStart {
                node_id: self.id.clone(),
                layer_index,
            },
        );

        let result = self.call(ctx, context).await;

        emit(
            &ctx.event_handler,
            Event::NodeEnd {
                node_id: self.id.clone(),
                ok: result.is_ok(),
            },
        );

        result
    }

    async fn call(&self, ctx: &ExecCtx, context: &RunContext) -> Result<String> {
        let prompt = self.render(context)?;
        let request = LlmRequest::new(&self.id, prompt, self.llm_config.clone());

        tracing::debug!(
            node_id = %self.id,
            model = %self.llm_config.model,
            prompt_chars = request.prompt.len(),
            "Calling LLM"
        );

        let call = ctx.backend.complete(&ctx.client, &ctx.base_url, &request);

        let response = match tokio::time::timeout(ctx.timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    node_id = %self.id,
                    timeout_ms = ctx.timeout.as_millis() as u64,
                    "LLM call timed out"
                );
                return Err(PipelineError::Timeout {
                    node_id: self.id.clone(),
                    after: ctx.timeout,
                });
            }
        };

        tracing::debug!(
            node_id = %self.id,
            status = response.status,
            response_chars = response.text.len(),
            "LLM call finished"
        );

        Ok(response.text)
    }
}
