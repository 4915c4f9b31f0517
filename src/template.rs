//! Prompt templates and the template store.
//!
//! A [`Template`] is opaque prompt text with `{name}` markers, the list of
//! names it binds at render time, and the single output key its node
//! produces. The [`TemplateStore`] owns the authoritative `id -> Template`
//! mapping and supports replace and merge loading.
//!
//! Use `{{` to insert a literal `{` and `}}` to insert a literal `}`. Braces
//! that do not enclose an identifier (`{"key": 1}`) are left untouched.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A prompt template bound to exactly one output key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Filled from the template map key when loaded into a [`TemplateStore`].
    #[serde(skip)]
    pub id: String,

    /// Prompt text with `{name}` markers.
    #[serde(rename = "template")]
    pub content: String,

    /// Names referenced by `content`.
    #[serde(default)]
    pub placeholders: Vec<String>,

    /// Names bound at render time: the seed key or earlier-layer outputs.
    #[serde(default)]
    pub input_context: Vec<String>,

    /// Key this template's node writes into the run context.
    pub expected_output: String,

    /// Extra guidance appended to the rendered prompt as bullet lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Template {
    /// Create a template with no inputs.
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            placeholders: Vec::new(),
            input_context: Vec::new(),
            expected_output: expected_output.into(),
            instructions: Vec::new(),
            description: None,
        }
    }

    /// Declare `names` as both placeholders and render-time inputs.
    pub fn with_inputs(mut self, names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        self.placeholders = names.clone();
        self.input_context = names;
        self
    }

    pub fn with_placeholders(mut self, names: &[&str]) -> Self {
        self.placeholders = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_input_context(mut self, names: &[&str]) -> Self {
        self.input_context = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: &[&str]) -> Self {
        self.instructions = instructions.iter().map(|i| i.to_string()).collect();
        self
    }

    /// Identifier markers (`{name}`) found in the content, in order of first appearance.
    pub fn markers(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        scan(&self.content, |piece| {
            if let Piece::Marker(name) = piece {
                if seen.insert(name.to_string()) {
                    out.push(name.to_string());
                }
            }
        });
        out
    }

    /// Structural self-check, independent of any graph.
    pub fn check(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let markers: BTreeSet<String> = self.markers().into_iter().collect();

        for placeholder in &self.placeholders {
            if !markers.contains(placeholder) {
                errors.push(ConfigError::PlaceholderNotInContent {
                    template_id: self.id.clone(),
                    placeholder: placeholder.clone(),
                });
            }
        }

        for name in &self.input_context {
            if !self.placeholders.contains(name) {
                errors.push(ConfigError::UndeclaredInput {
                    template_id: self.id.clone(),
                    name: name.clone(),
                });
            }
        }

        for marker in &markers {
            if !self.input_context.contains(marker) {
                errors.push(ConfigError::UndeclaredMarker {
                    template_id: self.id.clone(),
                    marker: marker.clone(),
                });
            }
        }

        errors
    }

    /// Render the template against `vars`.
    ///
    /// Substitution is single-pass, so values containing `{name}` text are
    /// inserted verbatim. Returns the name of the first marker with no value.
    pub fn render(&self, vars: &BTreeMap<&str, &str>) -> std::result::Result<String, String> {
        let mut rendered = String::with_capacity(self.content.len());
        let mut missing: Option<String> = None;

        scan(&self.content, |piece| match piece {
            Piece::Text(text) => rendered.push_str(text),
            Piece::Marker(name) => match vars.get(name) {
                Some(value) => rendered.push_str(value),
                None => {
                    if missing.is_none() {
                        missing = Some(name.to_string());
                    }
                }
            },
        });

        if let Some(name) = missing {
            return Err(name);
        }

        if !self.instructions.is_empty() {
            rendered.push_str("\n\n");
            rendered.push_str(&bullet_list(&self.instructions));
        }

        Ok(rendered)
    }
}

enum Piece<'a> {
    Text(&'a str),
    Marker(&'a str),
}

fn is_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split `content` into literal text and identifier markers.
fn scan<'a>(content: &'a str, mut f: impl FnMut(Piece<'a>)) {
    let bytes = content.as_bytes();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                f(Piece::Text(&content[start..i]));
                f(Piece::Text("{"));
                i += 2;
                start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                f(Piece::Text(&content[start..i]));
                f(Piece::Text("}"));
                i += 2;
                start = i;
            }
            b'{' => match content[i + 1..].find('}') {
                Some(len) if is_ident(&content[i + 1..i + 1 + len]) => {
                    f(Piece::Text(&content[start..i]));
                    f(Piece::Marker(&content[i + 1..i + 1 + len]));
                    i += len + 2;
                    start = i;
                }
                _ => i += 1,
            },
            _ => i += 1,
        }
    }

    f(Piece::Text(&content[start..]));
}

/// Render items as `- item` lines.
pub fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// How a new template set combines with the templates already loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadMode {
    /// Discard everything previously loaded, even if the new set is empty.
    #[default]
    Replace,
    /// Union with existing templates; newly loaded entries win on collision.
    Merge,
}

/// Authoritative `template_id -> Template` mapping.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: BTreeMap<String, Arc<Template>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a single template set.
    pub fn from_templates(templates: impl IntoIterator<Item = (String, Template)>) -> Self {
        let mut store = Self::new();
        store.load(templates, LoadMode::Replace);
        store
    }

    /// Load a template set. Each template's `id` is set from its map key.
    pub fn load(
        &mut self,
        templates: impl IntoIterator<Item = (String, Template)>,
        mode: LoadMode,
    ) {
        if mode == LoadMode::Replace {
            self.templates.clear();
        }
        let mut loaded = 0usize;
        for (id, mut template) in templates {
            template.id = id.clone();
            self.templates.insert(id, Arc::new(template));
            loaded += 1;
        }
        tracing::debug!(?mode, loaded, total = self.templates.len(), "Loaded templates");
    }

    /// Insert one template, keyed by its own `id`.
    pub fn insert(&mut self, template: Template) {
        self.templates.insert(template.id.clone(), Arc::new(template));
    }

    pub fn get(&self, template_id: &str) -> std::result::Result<Arc<Template>, ConfigError> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| ConfigError::TemplateNotFound {
                template_id: template_id.to_string(),
            })
    }

    pub fn has_template(&self, template_id: &str) -> bool {
        self.templates.contains_key(template_id)
    }

    /// Template ids in sorted order.
    pub fn list(&self) -> Vec<&str> {
        self.templates.keys().map(|k| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Template> {
        self.templates.values().map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(pairs: &[(&'a str, &'a str)]) -> BTreeMap<&'a str, &'a str> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_render_basic() {
        let t = Template::new("t", "Hello {name}, process {query}", "out")
            .with_inputs(&["name", "query"]);
        let result = t.render(&vars(&[("name", "Alice"), ("query", "data")]));
        assert_eq!(result.unwrap(), "Hello Alice, process data");
    }

    #[test]
    fn test_render_no_placeholders() {
        let t = Template::new("t", "static prompt", "out");
        assert_eq!(t.render(&vars(&[])).unwrap(), "static prompt");
    }

    #[test]
    fn test_render_escaped_braces() {
        let t = Template::new("t", "Hello {name}, JSON: {{\"key\": \"val\"}}", "out")
            .with_inputs(&["name"]);
        let result = t.render(&vars(&[("name", "Alice")])).unwrap();
        assert_eq!(result, r#"Hello Alice, JSON: {"key": "val"}"#);
    }

    #[test]
    fn test_render_leaves_non_identifier_braces() {
        let t = Template::new("t", r#"Format: {"type": "object"} for {q}"#, "out")
            .with_inputs(&["q"]);
        let result = t.render(&vars(&[("q", "x")])).unwrap();
        assert_eq!(result, r#"Format: {"type": "object"} for x"#);
    }

    #[test]
    fn test_render_missing_marker_is_error() {
        let t = Template::new("t", "Uses {a} and {b}", "out").with_inputs(&["a", "b"]);
        assert_eq!(t.render(&vars(&[("a", "1")])), Err("b".to_string()));
    }

    #[test]
    fn test_render_values_are_not_resubstituted() {
        let t = Template::new("t", "{a} then {b}", "out").with_inputs(&["a", "b"]);
        let result = t.render(&vars(&[("a", "{b}"), ("b", "B")])).unwrap();
        assert_eq!(result, "{b} then B");
    }

    #[test]
    fn test_render_appends_instructions() {
        let t = Template::new("t", "Answer {query}", "out")
            .with_inputs(&["query"])
            .with_instructions(&["Be brief", "Cite sources"]);
        let result = t.render(&vars(&[("query", "why?")])).unwrap();
        assert_eq!(result, "Answer why?\n\n- Be brief\n- Cite sources");
    }

    #[test]
    fn test_markers_in_order_without_duplicates() {
        let t = Template::new("t", "{b} {a} {b} {{c}}", "out");
        assert_eq!(t.markers(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_check_reports_structural_problems() {
        let mut t = Template::new("t", "Needs {a} and {z}", "out")
            .with_placeholders(&["a", "b"])
            .with_input_context(&["a", "c"]);
        t.id = "t".into();
        let errors = t.check();
        assert!(errors.contains(&ConfigError::PlaceholderNotInContent {
            template_id: "t".into(),
            placeholder: "b".into(),
        }));
        assert!(errors.contains(&ConfigError::UndeclaredInput {
            template_id: "t".into(),
            name: "c".into(),
        }));
        assert!(errors.contains(&ConfigError::UndeclaredMarker {
            template_id: "t".into(),
            marker: "z".into(),
        }));
    }

    #[test]
    fn test_check_accepts_well_formed() {
        let t = Template::new("t", "Use {query}", "out").with_inputs(&["query"]);
        assert!(t.check().is_empty());
    }

    #[test]
    fn test_store_replace_discards_previous() {
        let mut store = TemplateStore::new();
        store.load([("a".to_string(), Template::new("", "x", "a_out"))], LoadMode::Replace);
        store.load(Vec::<(String, Template)>::new(), LoadMode::Replace);
        assert!(store.is_empty());
        assert!(!store.has_template("a"));
    }

    #[test]
    fn test_store_merge_new_entries_win() {
        let mut store = TemplateStore::new();
        store.load(
            [
                ("a".to_string(), Template::new("", "old", "a_out")),
                ("b".to_string(), Template::new("", "keep", "b_out")),
            ],
            LoadMode::Replace,
        );
        store.load([("a".to_string(), Template::new("", "new", "a_out"))], LoadMode::Merge);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").unwrap().content, "new");
        assert_eq!(store.get("b").unwrap().content, "keep");
    }

    #[test]
    fn test_store_sets_id_from_key() {
        let entry = ("reformulate".to_string(), Template::new("", "x", "r"));
        let store = TemplateStore::from_templates([entry]);
        assert_eq!(store.get("reformulate").unwrap().id, "reformulate");
        assert_eq!(store.list(), vec!["reformulate"]);
    }

    #[test]
    fn test_store_get_missing_names_id() {
        let store = TemplateStore::new();
        let err = store.get("nope").unwrap_err();
        assert_eq!(
            err,
            ConfigError::TemplateNotFound {
                template_id: "nope".into()
            }
        );
    }

    #[test]
    fn test_template_deserializes_artifact_shape() {
        let t: Template = serde_json::from_str(
            r#"{
                "template": "Reformulate {query}",
                "placeholders": ["query"],
                "input_context": ["query"],
                "expected_output": "reformulated",
                "instructions": ["Keep meaning"]
            }"#,
        )
        .unwrap();
        assert_eq!(t.content, "Reformulate {query}");
        assert_eq!(t.expected_output, "reformulated");
        assert_eq!(t.instructions, vec!["Keep meaning".to_string()]);
        assert!(t.id.is_empty());
    }
}
