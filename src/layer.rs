//! A group of nodes that run concurrently.
//!
//! Every node in a layer sees the same run context snapshot: the state
//! produced by all earlier layers, and nothing from its siblings. A layer
//! is atomic. Either every node succeeds and all outputs are returned for
//! merging, or the layer fails and nothing it produced is kept.

use crate::{
    config::LayerSpec,
    error::{NodeFailure, Result},
    exec_ctx::ExecCtx,
    node::Node,
    template::TemplateStore,
    types::RunContext,
    PipelineError,
};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::BTreeMap;
use tracing::Instrument;

/// An ordered stage of the network.
#[derive(Debug, Clone)]
pub struct Layer {
    index: usize,
    id: String,
    name: String,
    description: Option<String>,
    nodes: Vec<Node>,
}

impl Layer {
    pub fn new(index: usize, id: impl Into<String>, nodes: Vec<Node>) -> Self {
        let id = id.into();
        Self {
            index,
            name: id.clone(),
            id,
            description: None,
            nodes,
        }
    }

    /// Build a layer from a validated description.
    pub(crate) fn from_spec(
        index: usize,
        spec: &LayerSpec,
        templates: &TemplateStore,
    ) -> Result<Self> {
        let nodes = spec
            .nodes
            .iter()
            .map(|node| {
                let template = templates.get(&node.template_id).map_err(|e| {
                    PipelineError::Other(format!("layer '{}' node '{}': {}", spec.id, node.id, e))
                })?;
                Ok(Node::from_spec(node, template))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            index,
            id: spec.id.clone(),
            name: if spec.name.is_empty() {
                spec.id.clone()
            } else {
                spec.name.clone()
            },
            description: spec.description.clone(),
            nodes,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == node_id)
    }

    /// Output keys this layer writes, in node order.
    pub fn outputs(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.output_key()).collect()
    }

    /// Run every node concurrently against the same context snapshot.
    ///
    /// Returns `output_key -> response` for all nodes. On the first node
    /// failure, results that are already available from siblings are
    /// collected, the rest are dropped (cancelling their in-flight calls),
    /// and [`PipelineError::LayerFailed`] lists every failure observed.
    pub async fn process(
        &self,
        ctx: &ExecCtx,
        context: &RunContext,
    ) -> Result<BTreeMap<String, String>> {
        let mut pending: FuturesUnordered<_> = self
            .nodes
            .iter()
            .map(|node| {
                let span = tracing::debug_span!("node", node_id = %node.id());
                async move { (node, node.process(ctx, context, self.index).await) }
                    .instrument(span)
            })
            .collect();

        let mut outputs = BTreeMap::new();

        while let Some((node, result)) = pending.next().await {
            match result {
                Ok(text) => {
                    outputs.insert(node.output_key().to_string(), text);
                }
                Err(error) => {
                    let mut failures = vec![NodeFailure {
                        node_id: node.id().to_string(),
                        error,
                    }];
                    while let Some(Some((node, result))) = pending.next().now_or_never() {
                        if let Err(error) = result {
                            failures.push(NodeFailure {
                                node_id: node.id().to_string(),
                                error,
                            });
                        }
                    }
                    let abandoned = pending.len();
                    drop(pending);

                    tracing::warn!(
                        layer_index = self.index,
                        layer_id = %self.id,
                        failed = failures.len(),
                        abandoned,
                        "Layer failed; discarding its outputs"
                    );

                    if failures
                        .iter()
                        .all(|f| matches!(f.error, PipelineError::Cancelled))
                    {
                        return Err(PipelineError::Cancelled);
                    }

                    return Err(PipelineError::LayerFailed {
                        layer_index: self.index,
                        layer_id: self.id.clone(),
                        failures,
                    });
                }
            }
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::client::LlmConfig;
    use crate::template::Template;
    use std::sync::Arc;
    use std::time::Duration;

    fn node(id: &str, output: &str) -> Node {
        let template =
            Template::new(format!("t_{}", id), format!("{} about {{query}}", id), output)
                .with_inputs(&["query"]);
        Node::new(id, Arc::new(template), LlmConfig::default())
    }

    fn ctx(mock: Arc<MockBackend>) -> ExecCtx {
        ExecCtx::builder("http://mock").backend(mock).build().unwrap()
    }

    #[tokio::test]
    async fn test_layer_collects_all_outputs() {
        let mock = Arc::new(MockBackend::responder(|req| Ok(format!("<{}>", req.node_id))));
        let layer = Layer::new(0, "l1", vec![node("a", "out_a"), node("b", "out_b")]);

        let outputs = layer
            .process(&ctx(mock.clone()), &RunContext::seeded("query", "q"))
            .await
            .unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs["out_a"], "<a>");
        assert_eq!(outputs["out_b"], "<b>");
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_layer_failure_discards_successes() {
        let mock = Arc::new(
            MockBackend::fixed("ok").fail_node("b", || PipelineError::Other("boom".into())),
        );
        let layer = Layer::new(3, "l4", vec![node("a", "out_a"), node("b", "out_b")]);

        let err = layer
            .process(&ctx(mock), &RunContext::seeded("query", "q"))
            .await
            .unwrap_err();

        match err {
            PipelineError::LayerFailed {
                layer_index,
                layer_id,
                failures,
            } => {
                assert_eq!(layer_index, 3);
                assert_eq!(layer_id, "l4");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].node_id, "b");
            }
            other => panic!("expected LayerFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_layer_failure_reports_every_ready_failure() {
        let mock = Arc::new(
            MockBackend::fixed("ok")
                .fail_node("a", || PipelineError::Other("a broke".into()))
                .fail_node("b", || PipelineError::Other("b broke".into())),
        );
        let layer = Layer::new(0, "l1", vec![node("a", "out_a"), node("b", "out_b")]);

        let err = layer
            .process(&ctx(mock), &RunContext::seeded("query", "q"))
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("a broke"), "{}", text);
        assert!(text.contains("b broke"), "{}", text);
    }

    #[tokio::test]
    async fn test_layer_failure_abandons_slow_siblings() {
        let mock = Arc::new(
            MockBackend::fixed("ok")
                .fail_node("fast", || PipelineError::Other("boom".into()))
                .delay_node("slow", Duration::from_secs(30)),
        );
        let layer = Layer::new(0, "l1", vec![node("slow", "out_slow"), node("fast", "out_fast")]);

        let started = std::time::Instant::now();
        let err = layer
            .process(&ctx(mock), &RunContext::seeded("query", "q"))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            PipelineError::LayerFailed { ref failures, .. } if failures.len() == 1
        ));
    }

    #[test]
    fn test_layer_accessors() {
        let layer = Layer::new(1, "l2", vec![node("a", "out_a"), node("b", "out_b")]);
        assert_eq!(layer.name(), "l2");
        assert_eq!(layer.outputs(), vec!["out_a", "out_b"]);
        assert!(layer.get_node("b").is_some());
        assert!(layer.get_node("c").is_none());
    }
}
