use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key/value store accumulated over one run.
///
/// Seeded with the user query, then grows by each layer's outputs. Keys are
/// write-once: a merge that would overwrite an existing key is refused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext {
    data: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context holding only the seed entry.
    pub fn seeded(seed_key: impl Into<String>, query: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(seed_key.into(), query.into());
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|s| s.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Insert a new key. Returns the rejected pair if the key already exists.
    pub fn insert_new(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> std::result::Result<(), (String, String)> {
        let key = key.into();
        if self.data.contains_key(&key) {
            return Err((key, value.into()));
        }
        self.data.insert(key, value.into());
        Ok(())
    }

    /// Merge a layer's outputs in one step.
    ///
    /// Nothing is written unless every key is new. Returns the first
    /// colliding key otherwise.
    pub fn merge_new(
        &mut self,
        outputs: BTreeMap<String, String>,
    ) -> std::result::Result<(), String> {
        if let Some(existing) = outputs.keys().find(|k| self.data.contains_key(*k)) {
            return Err(existing.clone());
        }
        self.data.extend(outputs);
        Ok(())
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.data
    }
}

impl From<RunContext> for BTreeMap<String, String> {
    fn from(ctx: RunContext) -> Self {
        ctx.data
    }
}

/// Progress update emitted after each layer's outputs have been merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerProgress {
    /// Index of the layer that just completed (0-based).
    pub layer_index: usize,

    /// Total number of layers in the pipeline.
    pub total_layers: usize,

    pub layer_id: String,

    /// Output keys the layer contributed, sorted.
    pub outputs: Vec<String>,
}
