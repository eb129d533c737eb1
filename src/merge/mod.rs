//! Deep merge of an incoming document into its stored version.
//!
//! The rules are applied recursively, object field by object field:
//!
//! - a field only in the stored document is retained
//! - a field only in the incoming document is added
//! - two objects are merged structurally
//! - two arrays whose elements are all objects carrying a unique key are merged by key:
//!   shared keys are merged recursively, stored order comes first, new incoming keys follow
//!   in incoming order
//! - anything else (scalars, type changes, unkeyed arrays) takes the incoming value
//!
//! Merging never fails and never mutates its inputs. `merge(merge(s, i), i) == merge(s, i)`
//! holds for every pair of documents.
//!
//! Full replacement is a separate entry point ([`MergePlanner::replace`]) and is only
//! chosen by [`ImportMode::Rebuild`].

use crate::config::ImportMode;
use crate::document::{Document, Fields};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Key fields tried, in order, for arrays without an explicit configuration.
pub const DEFAULT_KEY_CANDIDATES: [&str; 2] = ["id", "name"];

/// Which element field identifies array items, per dotted field path.
///
/// Paths are built from object field names only; array elements do not add a segment,
/// so the `value` field inside `is.checks[*]` has path `is.checks.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayKeys {
    by_path: HashMap<String, String>,
    candidates: Vec<String>,
}

impl Default for ArrayKeys {
    fn default() -> Self {
        Self {
            by_path: HashMap::new(),
            candidates: DEFAULT_KEY_CANDIDATES.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl ArrayKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the key field for one array path. Only that field is tried for the path.
    pub fn with_path(mut self, path: impl Into<String>, key: impl Into<String>) -> Self {
        self.by_path.insert(path.into(), key.into());
        self
    }

    /// Replace the fallback candidates tried for unconfigured paths.
    pub fn with_candidates<I, S>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidates = candidates.into_iter().map(Into::into).collect();
        self
    }

    /// Parse `path=key` pairs separated by commas, e.g. `is.checks=name,pyramids=name`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut keys = Self::default();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (path, key) = entry
                .split_once('=')
                .map(|(p, k)| (p.trim(), k.trim()))
                .filter(|(p, k)| !p.is_empty() && !k.is_empty())
                .ok_or_else(|| format!("expected path=key, got '{}'", entry))?;
            keys = keys.with_path(path, key);
        }
        Ok(keys)
    }

    fn candidates_for<'a>(&'a self, path: &str) -> Vec<&'a str> {
        match self.by_path.get(path) {
            Some(key) => vec![key.as_str()],
            None => self.candidates.iter().map(String::as_str).collect(),
        }
    }
}

/// Pure merge planner. Cheap to clone and safe to share across workers.
#[derive(Debug, Clone, Default)]
pub struct MergePlanner {
    keys: ArrayKeys,
}

impl MergePlanner {
    pub fn new(keys: ArrayKeys) -> Self {
        Self { keys }
    }

    /// Combine `incoming` with whatever is stored. With nothing stored the result is
    /// `incoming` unchanged.
    pub fn merge(&self, stored: Option<&Document>, incoming: &Document) -> Document {
        match stored {
            None => incoming.clone(),
            Some(stored) => Document::new(merge_fields(
                stored.fields(),
                incoming.fields(),
                "",
                &self.keys,
            )),
        }
    }

    /// Full replacement: the stored version is discarded wholesale. Historical fields
    /// not present in `incoming` are lost.
    pub fn replace(&self, incoming: &Document) -> Document {
        incoming.clone()
    }

    /// Pick merge or replacement for the import mode.
    pub fn plan(&self, mode: ImportMode, stored: Option<&Document>, incoming: &Document) -> Document {
        if mode.replaces_documents() {
            self.replace(incoming)
        } else {
            self.merge(stored, incoming)
        }
    }
}

fn merge_fields(stored: &Fields, incoming: &Fields, prefix: &str, keys: &ArrayKeys) -> Fields {
    let mut result = stored.clone();

    for (field, new_value) in incoming {
        let merged = match stored.get(field) {
            Some(old_value) => merge_value(old_value, new_value, &join_path(prefix, field), keys),
            None => new_value.clone(),
        };
        result.insert(field.clone(), merged);
    }

    result
}

fn merge_value(stored: &Value, incoming: &Value, path: &str, keys: &ArrayKeys) -> Value {
    match (stored, incoming) {
        (Value::Object(old), Value::Object(new)) => Value::Object(merge_fields(old, new, path, keys)),
        (Value::Array(old), Value::Array(new)) => merge_arrays(old, new, path, keys),
        _ => incoming.clone(),
    }
}

fn merge_arrays(stored: &[Value], incoming: &[Value], path: &str, keys: &ArrayKeys) -> Value {
    let Some(key) = detect_unique_key(stored, incoming, path, keys) else {
        return Value::Array(incoming.to_vec());
    };

    let incoming_by_key: HashMap<String, &Value> = incoming
        .iter()
        .filter_map(|item| element_key(item, key).map(|k| (k, item)))
        .collect();

    let mut seen = HashSet::with_capacity(stored.len());
    let mut result = Vec::with_capacity(stored.len() + incoming.len());

    for item in stored {
        let Some(item_key) = element_key(item, key) else {
            continue;
        };
        let merged = match incoming_by_key.get(&item_key) {
            Some(new_item) => merge_value(item, new_item, path, keys),
            None => item.clone(),
        };
        seen.insert(item_key);
        result.push(merged);
    }

    for item in incoming {
        if let Some(item_key) = element_key(item, key) {
            if !seen.contains(&item_key) {
                result.push(item.clone());
            }
        }
    }

    Value::Array(result)
}

/// First candidate key that every element on both sides carries with a scalar value,
/// unique within each side. Any unkeyed element disqualifies the whole array.
fn detect_unique_key<'a>(
    stored: &[Value],
    incoming: &[Value],
    path: &str,
    keys: &'a ArrayKeys,
) -> Option<&'a str> {
    if stored.is_empty() && incoming.is_empty() {
        return None;
    }

    keys.candidates_for(path)
        .into_iter()
        .find(|key| is_keyed_by(stored, key) && is_keyed_by(incoming, key))
}

fn is_keyed_by(items: &[Value], key: &str) -> bool {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .all(|item| element_key(item, key).is_some_and(|k| seen.insert(k)))
}

/// Canonical text of an element's key. JSON encoding keeps `"1"` and `1` distinct.
fn element_key(item: &Value, key: &str) -> Option<String> {
    match item.as_object()?.get(key)? {
        value @ (Value::String(_) | Value::Number(_)) => Some(value.to_string()),
        _ => None,
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}
