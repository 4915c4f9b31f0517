//! Load-time graph validation.
//!
//! [`GraphValidator`] is the single authority that decides whether a
//! `(layers, templates)` pair is executable. It runs before any LLM call and
//! reports every problem it finds in one pass.
//!
//! ## Resolution rule
//!
//! Layers are walked in index order with a running `available` set that
//! starts as `{seed_key}`. Every `input_context` entry of a node at layer `L`
//! must already be in `available`; only after all of layer `L` is checked are
//! its outputs added. Same-layer and forward references therefore fail as
//! unresolved placeholders without any special casing.

use crate::config::GraphSpec;
use crate::error::{ConfigError, ConfigErrors};
use crate::template::{Template, TemplateStore};
use std::collections::{BTreeMap, BTreeSet};

/// Whether `value` matches `^[a-z0-9_]+$`.
pub fn is_valid_output_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Validates a graph description against a template store.
#[derive(Debug, Clone)]
pub struct GraphValidator<'a> {
    seed_key: &'a str,
    final_output: Option<&'a str>,
}

impl<'a> GraphValidator<'a> {
    pub fn new(seed_key: &'a str) -> Self {
        Self {
            seed_key,
            final_output: None,
        }
    }

    /// Also require that `key` is produced by some layer.
    pub fn with_final_output(mut self, key: Option<&'a str>) -> Self {
        self.final_output = key;
        self
    }

    /// Check the whole graph. Pure: same inputs, same verdict, same error order.
    pub fn validate(
        &self,
        graph: &GraphSpec,
        store: &TemplateStore,
    ) -> std::result::Result<(), ConfigErrors> {
        let mut errors = Vec::new();

        if !is_valid_output_name(self.seed_key) {
            errors.push(ConfigError::InvalidSeedKey {
                value: self.seed_key.to_string(),
            });
        }

        self.check_structure(graph, &mut errors);
        let resolved = self.resolve_templates(graph, store, &mut errors);
        self.check_outputs(&resolved, &mut errors);
        self.check_placeholders(graph, &resolved, &mut errors);

        let unreferenced: Vec<&str> = store
            .list()
            .into_iter()
            .filter(|id| !resolved.iter().any(|r| r.template.id == *id))
            .collect();
        if !unreferenced.is_empty() {
            tracing::warn!(?unreferenced, "Templates not referenced by any node");
        }

        if errors.is_empty() {
            tracing::debug!(
                layers = graph.layers.len(),
                nodes = resolved.len(),
                "Graph validated"
            );
            Ok(())
        } else {
            tracing::debug!(problems = errors.len(), "Graph rejected");
            Err(ConfigErrors(errors))
        }
    }

    /// Non-empty pipeline and layers, unique layer and node ids, sane LLM configs.
    fn check_structure(&self, graph: &GraphSpec, errors: &mut Vec<ConfigError>) {
        if graph.layers.is_empty() {
            errors.push(ConfigError::EmptyPipeline);
        }

        let mut layer_ids = BTreeSet::new();
        let mut node_ids = BTreeSet::new();

        for layer in &graph.layers {
            if !layer_ids.insert(layer.id.as_str()) {
                errors.push(ConfigError::DuplicateLayerId {
                    layer_id: layer.id.clone(),
                });
            }
            if layer.nodes.is_empty() {
                errors.push(ConfigError::EmptyLayer {
                    layer_id: layer.id.clone(),
                });
            }
            for node in &layer.nodes {
                if !node_ids.insert(node.id.as_str()) {
                    errors.push(ConfigError::DuplicateNodeId {
                        node_id: node.id.clone(),
                    });
                }
                if let Err(reason) = node.llm_config.check() {
                    errors.push(ConfigError::InvalidLlmConfig {
                        node_id: node.id.clone(),
                        reason,
                    });
                }
            }
        }
    }

    /// Look up every node's template and run each referenced template's self-check once.
    fn resolve_templates<'g>(
        &self,
        graph: &'g GraphSpec,
        store: &TemplateStore,
        errors: &mut Vec<ConfigError>,
    ) -> Vec<Resolved<'g>> {
        let mut resolved = Vec::new();
        let mut checked = BTreeSet::new();

        for (layer_index, layer) in graph.layers.iter().enumerate() {
            for node in &layer.nodes {
                let template = match store.get(&node.template_id) {
                    Ok(t) => t,
                    Err(_) => {
                        errors.push(ConfigError::MissingTemplate {
                            node_id: node.id.clone(),
                            layer_index,
                            template_id: node.template_id.clone(),
                        });
                        continue;
                    }
                };

                if checked.insert(template.id.clone()) {
                    errors.extend(template.check());
                }

                if let Some(declared) = &node.expected_output {
                    if declared != &template.expected_output {
                        errors.push(ConfigError::OutputMismatch {
                            node_id: node.id.clone(),
                            declared: declared.clone(),
                            template_output: template.expected_output.clone(),
                        });
                    }
                }

                resolved.push(Resolved {
                    layer_index,
                    node_id: &node.id,
                    template,
                });
            }
        }

        resolved
    }

    /// Output names are well-formed, not the seed key, and globally unique.
    fn check_outputs(&self, resolved: &[Resolved<'_>], errors: &mut Vec<ConfigError>) {
        let mut named = BTreeSet::new();
        let mut producers: BTreeMap<&str, Vec<&Resolved<'_>>> = BTreeMap::new();

        for r in resolved {
            let value = r.template.expected_output.as_str();
            if named.insert(r.template.id.as_str()) {
                if !is_valid_output_name(value) {
                    errors.push(ConfigError::InvalidOutputName {
                        template_id: r.template.id.clone(),
                        value: value.to_string(),
                    });
                } else if value == self.seed_key {
                    errors.push(ConfigError::ReservedOutput {
                        template_id: r.template.id.clone(),
                        value: value.to_string(),
                    });
                }
            }
            producers.entry(value).or_default().push(r);
        }

        for (key, group) in producers {
            if group.len() > 1 {
                errors.push(ConfigError::DuplicateOutput {
                    duplicate_key: key.to_string(),
                    template_ids: group.iter().map(|r| r.template.id.clone()).collect(),
                    node_ids: group.iter().map(|r| r.node_id.to_string()).collect(),
                });
            }
        }

        if let Some(key) = self.final_output {
            if !resolved.iter().any(|r| r.template.expected_output == key) {
                errors.push(ConfigError::UnknownFinalOutput {
                    key: key.to_string(),
                });
            }
        }
    }

    /// Feed-forward resolution against the layer-indexed availability set.
    fn check_placeholders(
        &self,
        graph: &GraphSpec,
        resolved: &[Resolved<'_>],
        errors: &mut Vec<ConfigError>,
    ) {
        let mut available: BTreeSet<String> = BTreeSet::new();
        available.insert(self.seed_key.to_string());

        for layer_index in 0..graph.layers.len() {
            let in_layer: Vec<&Resolved<'_>> = resolved
                .iter()
                .filter(|r| r.layer_index == layer_index)
                .collect();

            for r in &in_layer {
                for name in &r.template.input_context {
                    if !available.contains(name) {
                        errors.push(ConfigError::UnresolvedPlaceholder {
                            node_id: r.node_id.to_string(),
                            layer_index,
                            template_id: r.template.id.clone(),
                            missing_placeholder: name.clone(),
                            available_outputs: available.iter().cloned().collect(),
                        });
                    }
                }
            }

            for r in in_layer {
                available.insert(r.template.expected_output.clone());
            }
        }
    }
}

struct Resolved<'g> {
    layer_index: usize,
    node_id: &'g str,
    template: std::sync::Arc<Template>,
}
