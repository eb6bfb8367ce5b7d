//! Item accumulation per response shape

use crate::config::MergeConfig;
use indexmap::IndexMap;
use serde_json::Value;

/// Keys a de-duplicating accumulator has seen, per array field
pub type SeenKeys = IndexMap<String, Vec<String>>;

/// Extracts the items a page contributes
pub trait MergeStrategy: Send {
    /// Returns only the items this page adds to the stream's accumulation
    fn merge(&mut self, body: &Value) -> Vec<Value>;

    /// Total number of items accumulated so far
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items accumulated for `field`, for strategies that retain them
    fn merged(&self, _field: &str) -> Vec<&Value> {
        Vec::new()
    }

    /// Keys to save with the stream's position so a resume skips them
    fn seen_keys(&self) -> SeenKeys {
        SeenKeys::new()
    }

    /// Marks keys saved by an earlier run as already accumulated
    fn seed(&mut self, _seen: &SeenKeys) {}
}

/// Appends every element of one array field, in page order
#[derive(Debug, Clone)]
pub struct FlatAppend {
    field: String,
    seen: usize,
}

impl FlatAppend {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            seen: 0,
        }
    }
}

impl MergeStrategy for FlatAppend {
    fn merge(&mut self, body: &Value) -> Vec<Value> {
        let items = body
            .get(&self.field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        self.seen += items.len();
        items
    }

    fn len(&self) -> usize {
        self.seen
    }
}

/// De-duplicates items of several array fields by a key field
///
/// Each field keeps its own order-preserving map. A re-seen item replaces
/// the stored value but keeps its original position and is not returned
/// again. Seeded keys carry no value until their item is seen again.
#[derive(Debug, Clone)]
pub struct MergeById {
    key: String,
    fields: IndexMap<String, IndexMap<String, Option<Value>>>,
}

impl MergeById {
    pub fn new<I, S>(fields: I, key: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            fields: fields
                .into_iter()
                .map(|field| (field.into(), IndexMap::new()))
                .collect(),
        }
    }
}

impl MergeStrategy for MergeById {
    fn merge(&mut self, body: &Value) -> Vec<Value> {
        let mut fresh = Vec::new();
        for (field, merged) in self.fields.iter_mut() {
            let Some(items) = body.get(field).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let Some(id) = item.get(&self.key).and_then(key_string) else {
                    continue;
                };
                if merged.insert(id, Some(item.clone())).is_none() {
                    fresh.push(item.clone());
                }
            }
        }
        fresh
    }

    fn len(&self) -> usize {
        self.fields.values().map(IndexMap::len).sum()
    }

    /// Items accumulated for `field`, in first-seen order
    fn merged(&self, field: &str) -> Vec<&Value> {
        self.fields
            .get(field)
            .map(|items| items.values().filter_map(Option::as_ref).collect())
            .unwrap_or_default()
    }

    fn seen_keys(&self) -> SeenKeys {
        self.fields
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(field, items)| (field.clone(), items.keys().cloned().collect()))
            .collect()
    }

    fn seed(&mut self, seen: &SeenKeys) {
        for (field, keys) in seen {
            let Some(merged) = self.fields.get_mut(field) else {
                continue;
            };
            for key in keys {
                merged.entry(key.clone()).or_insert(None);
            }
        }
    }
}

/// Renders an identifier value as a string key
///
/// Strings are taken as-is, numbers in their JSON form.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Returns a fresh strategy for a configured merge
pub fn merge_for(config: &MergeConfig) -> Box<dyn MergeStrategy> {
    match config {
        MergeConfig::Flat { field } => Box::new(FlatAppend::new(field.clone())),
        MergeConfig::ById { fields, key } => Box::new(MergeById::new(fields.clone(), key.clone())),
    }
}
