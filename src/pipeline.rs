//! The executable propagation network.
//!
//! A [`Pipeline`] owns its [`TemplateStore`], the declarative [`GraphSpec`]
//! it was built from, and the constructed [`Layer`]s. It can only exist in a
//! validated state: construction and every later mutation run the full
//! [`GraphValidator`] and commit only when the new graph is valid.
//!
//! A run seeds a fresh [`RunContext`] with the user query, executes layers in
//! index order, and merges each layer's outputs in a single step before the
//! next layer starts. The first failing layer aborts the run.

use crate::{
    config::{GraphSpec, LayerSpec, TemplateFile},
    error::Result,
    events::{emit, Event},
    exec_ctx::ExecCtx,
    layer::Layer,
    template::{LoadMode, Template, TemplateStore},
    types::{LayerProgress, RunContext},
    validator::GraphValidator,
    PipelineError,
};
use std::path::Path;
use std::time::Instant;
use tracing::Instrument;

/// Default name of the context key holding the user query.
pub const DEFAULT_SEED_KEY: &str = "query";

/// A validated, executable layered LLM network.
///
/// # Example
///
/// ```
/// use llm_propagation::{LayerSpec, NodeSpec, Pipeline, Template};
///
/// let pipeline = Pipeline::builder()
///     .template(
///         Template::new("reformulate", "Restate: {query}", "reformulated")
///             .with_inputs(&["query"]),
///     )
///     .layer(LayerSpec::new("layer1").node(NodeSpec::new("reformulator", "reformulate")))
///     .build()
///     .unwrap();
///
/// assert_eq!(pipeline.layers().len(), 1);
/// ```
pub struct Pipeline {
    spec: GraphSpec,
    templates: TemplateStore,
    layers: Vec<Layer>,
    seed_key: String,
    final_output: Option<String>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("layers", &self.layers.iter().map(|l| l.id()).collect::<Vec<_>>())
            .field("templates", &self.templates.list())
            .field("seed_key", &self.seed_key)
            .field("final_output", &self.final_output)
            .finish()
    }
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Build a pipeline from a graph description and template entries.
    ///
    /// Uses the default seed key. Fails with [`PipelineError::Config`]
    /// listing every problem if the graph is not executable.
    pub fn load(
        graph: GraphSpec,
        templates: impl IntoIterator<Item = (String, Template)>,
        mode: LoadMode,
    ) -> Result<Self> {
        Self::builder().templates(templates, mode).graph(graph).build()
    }

    /// Build a pipeline from a layers artifact and a templates artifact on disk.
    pub fn from_paths(layers: impl AsRef<Path>, templates: impl AsRef<Path>) -> Result<Self> {
        let graph = GraphSpec::from_path(layers)?;
        let templates = TemplateFile::from_path(templates)?;
        Self::load(graph, templates.into_templates(), LoadMode::Replace)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn get_layer(&self, layer_id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id() == layer_id)
    }

    pub fn seed_key(&self) -> &str {
        &self.seed_key
    }

    pub fn final_output(&self) -> Option<&str> {
        self.final_output.as_deref()
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// The declarative description the current layers were built from.
    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    /// Append a layer. The pipeline is unchanged if the result is invalid.
    pub fn add_layer(&mut self, layer: LayerSpec) -> Result<()> {
        let mut spec = self.spec.clone();
        spec.layers.push(layer);
        self.commit(spec, self.templates.clone())
    }

    /// Insert a layer at `position` (0 = first). Later layers shift down.
    pub fn insert_layer(&mut self, position: usize, layer: LayerSpec) -> Result<()> {
        if position > self.spec.layers.len() {
            return Err(PipelineError::InvalidConfig(format!(
                "layer position {} is out of range (pipeline has {} layers)",
                position,
                self.spec.layers.len()
            )));
        }
        let mut spec = self.spec.clone();
        spec.layers.insert(position, layer);
        self.commit(spec, self.templates.clone())
    }

    /// Reload templates with an explicit mode and rebuild every node.
    pub fn load_templates(
        &mut self,
        templates: impl IntoIterator<Item = (String, Template)>,
        mode: LoadMode,
    ) -> Result<()> {
        let mut store = self.templates.clone();
        store.load(templates, mode);
        self.commit(self.spec.clone(), store)
    }

    fn commit(&mut self, spec: GraphSpec, templates: TemplateStore) -> Result<()> {
        let layers = assemble(&spec, &templates, &self.seed_key, self.final_output.as_deref())?;
        self.spec = spec;
        self.templates = templates;
        self.layers = layers;
        Ok(())
    }

    /// Run the network for one query and return the full context.
    pub async fn process(&self, ctx: &ExecCtx, input: impl Into<String>) -> Result<RunContext> {
        self.process_with_progress(ctx, input, |_, _| {}).await
    }

    /// Run the network, invoking `on_layer` after each layer's outputs are merged.
    ///
    /// The callback receives the progress record and the context as it
    /// stands after the merge.
    pub async fn process_with_progress<F>(
        &self,
        ctx: &ExecCtx,
        input: impl Into<String>,
        on_layer: F,
    ) -> Result<RunContext>
    where
        F: FnMut(&LayerProgress, &RunContext),
    {
        let span = tracing::info_span!("propagation_run", layers = self.layers.len());
        self.run(ctx, input.into(), on_layer).instrument(span).await
    }

    /// Run the network and return only the designated final output.
    ///
    /// The final output is the configured `final_output` key, or else the
    /// sole output of the last layer when it has exactly one node.
    pub async fn process_final(&self, ctx: &ExecCtx, input: impl Into<String>) -> Result<String> {
        let key = self.final_output_key()?.to_string();
        let mut context = self.process(ctx, input).await?.into_inner();
        context
            .remove(&key)
            .ok_or_else(|| {
                PipelineError::NoFinalOutput(format!("'{}' missing from run context", key))
            })
    }

    fn final_output_key(&self) -> Result<&str> {
        if let Some(ref key) = self.final_output {
            return Ok(key);
        }
        match self.layers.last().map(|l| l.nodes()) {
            Some([node]) => Ok(node.output_key()),
            Some(nodes) => Err(PipelineError::NoFinalOutput(format!(
                "last layer has {} nodes; set a final output key",
                nodes.len()
            ))),
            None => Err(PipelineError::NoFinalOutput("pipeline has no layers".into())),
        }
    }

    async fn run<F>(&self, ctx: &ExecCtx, input: String, mut on_layer: F) -> Result<RunContext>
    where
        F: FnMut(&LayerProgress, &RunContext),
    {
        let started = Instant::now();
        let total_layers = self.layers.len();
        let mut context = RunContext::seeded(&self.seed_key, input);

        tracing::info!(seed_key = %self.seed_key, total_layers, "Run started");
        emit(
            &ctx.event_handler,
            Event::RunStart {
                layers: total_layers,
            },
        );

        for layer in &self.layers {
            if let Err(e) = ctx.check_cancelled() {
                tracing::info!(layer_index = layer.index(), "Run cancelled before layer");
                emit(&ctx.event_handler, Event::RunEnd { ok: false });
                return Err(e);
            }

            let layer_started = Instant::now();
            tracing::debug!(
                layer_index = layer.index(),
                layer_id = %layer.id(),
                nodes = layer.nodes().len(),
                "Layer started"
            );
            emit(
                &ctx.event_handler,
                Event::LayerStart {
                    index: layer.index(),
                    id: layer.id().to_string(),
                },
            );

            let merged = match layer.process(ctx, &context).await {
                Ok(outputs) => {
                    let keys: Vec<String> = outputs.keys().cloned().collect();
                    context
                        .merge_new(outputs)
                        .map(|()| keys)
                        .map_err(|key| {
                            PipelineError::Other(format!(
                                "layer '{}' would overwrite context key '{}'",
                                layer.id(),
                                key
                            ))
                        })
                }
                Err(e) => Err(e),
            };

            emit(
                &ctx.event_handler,
                Event::LayerEnd {
                    index: layer.index(),
                    id: layer.id().to_string(),
                    ok: merged.is_ok(),
                },
            );

            let outputs = match merged {
                Ok(outputs) => outputs,
                Err(e) => {
                    tracing::error!(
                        layer_index = layer.index(),
                        layer_id = %layer.id(),
                        error = %e,
                        "Run aborted"
                    );
                    emit(&ctx.event_handler, Event::RunEnd { ok: false });
                    return Err(e);
                }
            };

            tracing::debug!(
                layer_index = layer.index(),
                layer_id = %layer.id(),
                ?outputs,
                elapsed_ms = layer_started.elapsed().as_millis() as u64,
                "Layer merged"
            );

            on_layer(
                &LayerProgress {
                    layer_index: layer.index(),
                    total_layers,
                    layer_id: layer.id().to_string(),
                    outputs,
                },
                &context,
            );
        }

        tracing::info!(
            keys = context.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );
        emit(&ctx.event_handler, Event::RunEnd { ok: true });

        Ok(context)
    }
}

/// Validate a graph and construct its layers.
fn assemble(
    spec: &GraphSpec,
    templates: &TemplateStore,
    seed_key: &str,
    final_output: Option<&str>,
) -> Result<Vec<Layer>> {
    GraphValidator::new(seed_key)
        .with_final_output(final_output)
        .validate(spec, templates)
        .map_err(|errors| {
            tracing::error!(problems = errors.len(), "Graph validation failed:\n{}", errors);
            errors
        })?;

    spec.layers
        .iter()
        .enumerate()
        .map(|(index, layer)| Layer::from_spec(index, layer, templates))
        .collect()
}

/// Builder for [`Pipeline`].
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    spec: GraphSpec,
    templates: TemplateStore,
    seed_key: Option<String>,
    final_output: Option<String>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load template entries into the builder's store.
    pub fn templates(
        mut self,
        templates: impl IntoIterator<Item = (String, Template)>,
        mode: LoadMode,
    ) -> Self {
        self.templates.load(templates, mode);
        self
    }

    /// Add a single template, keyed by its `id`.
    pub fn template(mut self, template: Template) -> Self {
        self.templates.insert(template);
        self
    }

    /// Replace the graph description.
    pub fn graph(mut self, spec: GraphSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Append a layer description.
    pub fn layer(mut self, layer: LayerSpec) -> Self {
        self.spec.layers.push(layer);
        self
    }

    /// Name of the context key holding the user query. Default: `"query"`.
    pub fn seed_key(mut self, key: impl Into<String>) -> Self {
        self.seed_key = Some(key.into());
        self
    }

    /// Output key returned by [`Pipeline::process_final`].
    pub fn final_output(mut self, key: impl Into<String>) -> Self {
        self.final_output = Some(key.into());
        self
    }

    /// Validate the graph and build the pipeline.
    pub fn build(self) -> Result<Pipeline> {
        let seed_key = self
            .seed_key
            .unwrap_or_else(|| DEFAULT_SEED_KEY.to_string());
        let layers = assemble(
            &self.spec,
            &self.templates,
            &seed_key,
            self.final_output.as_deref(),
        )?;

        tracing::info!(
            layers = layers.len(),
            templates = self.templates.len(),
            %seed_key,
            "Pipeline built"
        );

        Ok(Pipeline {
            spec: self.spec,
            templates: self.templates,
            layers,
            seed_key,
            final_output: self.final_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::NodeSpec;
    use crate::error::ConfigError;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn two_layer_builder() -> PipelineBuilder {
        Pipeline::builder()
            .template(
                Template::new("reformulate", "Restate {query}", "reformulated")
                    .with_inputs(&["query"]),
            )
            .template(
                Template::new("answer", "Answer {reformulated}", "answer")
                    .with_inputs(&["reformulated"]),
            )
            .layer(LayerSpec::new("layer1").node(NodeSpec::new("reformulator", "reformulate")))
            .layer(LayerSpec::new("layer2").node(NodeSpec::new("answerer", "answer")))
    }

    fn mock_ctx(mock: Arc<MockBackend>) -> ExecCtx {
        ExecCtx::builder("http://mock").backend(mock).build().unwrap()
    }

    #[test]
    fn test_builder_rejects_empty_pipeline() {
        let err = Pipeline::builder().build().unwrap_err();
        match err {
            PipelineError::Config(errors) => {
                assert!(errors.errors().contains(&ConfigError::EmptyPipeline));
            }
            other => panic!("expected Config, got {:?}", other),
        }
    }

    #[test]
    fn test_get_layer_and_accessors() {
        let pipeline = two_layer_builder().build().unwrap();
        assert_eq!(pipeline.seed_key(), "query");
        assert_eq!(pipeline.get_layer("layer2").unwrap().index(), 1);
        assert!(pipeline.get_layer("layer9").is_none());
        assert_eq!(pipeline.templates().len(), 2);
        assert_eq!(pipeline.spec().layers.len(), 2);
    }

    #[test]
    fn test_add_layer_invalid_leaves_pipeline_unchanged() {
        let mut pipeline = two_layer_builder().build().unwrap();
        let err = pipeline
            .add_layer(LayerSpec::new("layer3").node(NodeSpec::new("ghost", "missing")))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(pipeline.layers().len(), 2);
    }

    #[test]
    fn test_insert_layer_revalidates_references() {
        let mut pipeline = Pipeline::builder()
            .template(Template::new("answer", "Answer {query}", "answer").with_inputs(&["query"]))
            .template(
                Template::new("polish", "Polish {answer}", "polished").with_inputs(&["answer"]),
            )
            .layer(LayerSpec::new("answering").node(NodeSpec::new("answerer", "answer")))
            .build()
            .unwrap();

        // Placed before its dependency: rejected.
        let early = LayerSpec::new("polishing").node(NodeSpec::new("polisher", "polish"));
        assert!(pipeline.insert_layer(0, early.clone()).is_err());
        assert_eq!(pipeline.layers().len(), 1);

        pipeline.insert_layer(1, early).unwrap();
        assert_eq!(pipeline.layers()[1].id(), "polishing");
        assert_eq!(pipeline.layers()[1].index(), 1);
    }

    #[test]
    fn test_insert_layer_out_of_range() {
        let mut pipeline = two_layer_builder().build().unwrap();
        let err = pipeline.insert_layer(5, LayerSpec::new("x")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_templates_merge_rebuilds_nodes() {
        let mut pipeline = two_layer_builder().build().unwrap();
        let replacement = Template::new("answer", "Briefly answer {reformulated}", "answer")
            .with_inputs(&["reformulated"]);
        pipeline
            .load_templates(vec![("answer".to_string(), replacement)], LoadMode::Merge)
            .unwrap();

        let node = pipeline.get_layer("layer2").unwrap().get_node("answerer").unwrap();
        assert_eq!(node.template().content, "Briefly answer {reformulated}");
        assert_eq!(pipeline.templates().len(), 2);
    }

    #[test]
    fn test_load_templates_replace_that_breaks_graph_is_refused() {
        let mut pipeline = two_layer_builder().build().unwrap();
        let only = Template::new("answer", "Answer {query}", "answer").with_inputs(&["query"]);
        let err = pipeline
            .load_templates(vec![("answer".to_string(), only)], LoadMode::Replace)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(pipeline.templates().has_template("reformulate"));
    }

    #[tokio::test]
    async fn test_process_final_uses_last_single_node() {
        let mock = Arc::new(MockBackend::responder(|req| Ok(format!("[{}]", req.prompt))));
        let pipeline = two_layer_builder().build().unwrap();

        let answer = pipeline.process_final(&mock_ctx(mock), "why?").await.unwrap();
        assert_eq!(answer, "[Answer [Restate why?]]");
    }

    #[tokio::test]
    async fn test_process_final_without_designated_output() {
        let pipeline = Pipeline::builder()
            .template(Template::new("a", "{query}", "out_a").with_inputs(&["query"]))
            .template(Template::new("b", "{query}", "out_b").with_inputs(&["query"]))
            .layer(
                LayerSpec::new("l1")
                    .node(NodeSpec::new("na", "a"))
                    .node(NodeSpec::new("nb", "b")),
            )
            .build()
            .unwrap();

        let mock = Arc::new(MockBackend::fixed("x"));
        let err = pipeline.process_final(&mock_ctx(mock.clone()), "q").await.unwrap_err();
        assert!(matches!(err, PipelineError::NoFinalOutput(_)));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_custom_seed_key_and_final_output() {
        let pipeline = Pipeline::builder()
            .seed_key("question")
            .final_output("draft")
            .template(
                Template::new("draft", "Draft: {question}", "draft").with_inputs(&["question"]),
            )
            .template(
                Template::new("notes", "Notes: {question}", "notes").with_inputs(&["question"]),
            )
            .layer(
                LayerSpec::new("l1")
                    .node(NodeSpec::new("drafter", "draft"))
                    .node(NodeSpec::new("noter", "notes")),
            )
            .build()
            .unwrap();

        let mock = Arc::new(MockBackend::responder(|req| Ok(req.node_id.clone())));
        let out = pipeline.process_final(&mock_ctx(mock), "hello").await.unwrap();
        assert_eq!(out, "drafter");
    }

    #[tokio::test]
    async fn test_cancelled_run_makes_no_calls() {
        let mock = Arc::new(MockBackend::fixed("x"));
        let ctx = ExecCtx::builder("http://mock")
            .backend(mock.clone())
            .cancellation(Some(Arc::new(AtomicBool::new(true))))
            .build()
            .unwrap();
        let pipeline = two_layer_builder().build().unwrap();

        let err = pipeline.process(&ctx, "q").await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_events_follow_run_lifecycle() {
        use crate::events::FnEventHandler;
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = ExecCtx::builder("http://mock")
            .backend(Arc::new(MockBackend::fixed("x")))
            .event_handler(Arc::new(FnEventHandler(move |e: Event| {
                sink.lock().unwrap().push(e)
            })))
            .build()
            .unwrap();

        two_layer_builder().build().unwrap().process(&ctx, "q").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&Event::RunStart { layers: 2 }));
        assert_eq!(seen.last(), Some(&Event::RunEnd { ok: true }));
        let layer_ends = seen
            .iter()
            .filter(|e| matches!(e, Event::LayerEnd { ok: true, .. }))
            .count();
        assert_eq!(layer_ends, 2);
    }
}
