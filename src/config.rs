//! Declarative graph descriptions and their on-disk artifacts.
//!
//! Two artifacts describe a network:
//!
//! ```text
//! layers:    {"layers": [{"id", "name", "nodes": [{"id", "template_id", "llm_config"}]}]}
//! templates: {"templates": {"<template_id>": {"template", "placeholders",
//!                                             "input_context", "expected_output"}}}
//! ```
//!
//! JSON is always supported. YAML is available with the `yaml` feature and is
//! selected by a `.yaml`/`.yml` file extension.

use crate::client::LlmConfig;
use crate::error::Result;
use crate::template::Template;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One node in a layer description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Orchestration-only identifier. Never a placeholder name.
    pub id: String,

    pub template_id: String,

    /// Optional restatement of the template's output key; must match it when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,

    #[serde(default)]
    pub llm_config: LlmConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Accepted for compatibility with existing artifacts; the engine has no node types.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template_id: template_id.into(),
            expected_output: None,
            llm_config: LlmConfig::default(),
            name: None,
            description: None,
            node_type: None,
        }
    }

    pub fn with_llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    pub fn with_expected_output(mut self, output: impl Into<String>) -> Self {
        self.expected_output = Some(output.into());
        self
    }
}

/// One layer description. Node order carries no priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

impl LayerSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            nodes: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a node (builder style).
    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }
}

/// The layers artifact: ordered layers, index = execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub layers: Vec<LayerSpec>,
}

impl GraphSpec {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self { layers }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        read_artifact(path.as_ref())
    }
}

/// The templates artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateFile {
    pub templates: BTreeMap<String, Template>,
}

impl TemplateFile {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        read_artifact(path.as_ref())
    }

    /// Template entries with their `id` set from the map key.
    pub fn into_templates(self) -> Vec<(String, Template)> {
        self.templates
            .into_iter()
            .map(|(id, mut template)| {
                template.id = id.clone();
                (id, template)
            })
            .collect()
    }
}

fn read_artifact<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    tracing::debug!(path = %path.display(), bytes = text.len(), "Read configuration artifact");

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    if is_yaml {
        #[cfg(feature = "yaml")]
        {
            return Ok(serde_yaml::from_str(&text)?);
        }
        #[cfg(not(feature = "yaml"))]
        {
            return Err(crate::PipelineError::InvalidConfig(format!(
                "{} is YAML but the `yaml` feature is disabled",
                path.display()
            )));
        }
    }

    Ok(serde_json::from_str(&text)?)
}
