//! In-memory node-graph document
//!
//! A document is a map of node ids to JSON objects. Operations address a node
//! by id and, optionally, a property nested inside it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::change::Change;
use super::operation::{Diff, Operation};
use crate::error::{CollabError, CollabResult};

/// Document state that changes are applied to
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    nodes: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Value at a node or nested property path
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let (id, rest) = path.split_first()?;
        let mut current = self.nodes.get(id)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// String property as text, if present
    pub fn get_text(&self, path: &[String]) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    fn get_path_mut(&mut self, path: &[String]) -> Option<&mut Value> {
        let (id, rest) = path.split_first()?;
        let mut current = self.nodes.get_mut(id)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Apply a single operation
    pub fn apply(&mut self, op: &Operation) -> CollabResult<()> {
        match op {
            Operation::Create { path, value } => {
                let id = node_path(path)?;
                if !value.is_object() {
                    return Err(CollabError::apply(path, "node must be an object"));
                }
                if self.nodes.contains_key(id) {
                    return Err(CollabError::apply(path, "node already exists"));
                }
                self.nodes.insert(id.to_string(), value.clone());
            }
            Operation::Delete { path, .. } => {
                let id = node_path(path)?;
                if self.nodes.remove(id).is_none() {
                    return Err(CollabError::apply(path, "node does not exist"));
                }
            }
            Operation::Set { path, value, .. } => {
                let (key, parent_path) = match path.split_last() {
                    Some((key, parent)) if !parent.is_empty() => (key, parent),
                    _ => return Err(CollabError::apply(path, "set needs a property path")),
                };
                let parent = self
                    .get_path_mut(parent_path)
                    .ok_or_else(|| CollabError::apply(path, "parent does not exist"))?;
                let Value::Object(map) = parent else {
                    return Err(CollabError::apply(path, "parent is not an object"));
                };
                if value.is_null() {
                    map.remove(key);
                } else {
                    map.insert(key.clone(), value.clone());
                }
            }
            Operation::Update { path, diff } => {
                let target = self
                    .get_path_mut(path)
                    .ok_or_else(|| CollabError::apply(path, "property does not exist"))?;
                apply_diff(target, diff).map_err(|reason| CollabError::apply(path, reason))?;
            }
        }
        Ok(())
    }

    /// Apply all ops of a change, atomically
    ///
    /// If an op fails, the ops applied so far are inverted in reverse order
    /// before the error is returned.
    pub fn apply_change(&mut self, change: &Change) -> CollabResult<()> {
        for (idx, op) in change.ops.iter().enumerate() {
            if let Err(err) = self.apply(op) {
                self.revert(&change.ops[..idx]);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Undo already-applied ops, newest first
    pub(crate) fn revert(&mut self, applied: &[Operation]) {
        for op in applied.iter().rev() {
            if let Err(err) = self.apply(&op.invert()) {
                tracing::warn!("Failed to revert {}: {}", op.describe(), err);
            }
        }
    }
}

fn node_path(path: &[String]) -> CollabResult<&str> {
    match path {
        [id] => Ok(id),
        _ => Err(CollabError::apply(path, "node operations take a single-segment path")),
    }
}

fn apply_diff(target: &mut Value, diff: &Diff) -> Result<(), String> {
    match (target, diff) {
        (Value::String(s), Diff::Insert { pos, text }) => {
            let at = byte_offset(s, *pos).ok_or("insert position out of range")?;
            s.insert_str(at, text);
            Ok(())
        }
        (Value::String(s), Diff::Delete { pos, text }) => {
            let start = byte_offset(s, *pos).ok_or("delete position out of range")?;
            let end = start + text.len();
            if s.get(start..end) != Some(text.as_str()) {
                return Err(format!("deleted text '{}' does not match document", text));
            }
            s.replace_range(start..end, "");
            Ok(())
        }
        (Value::Array(items), Diff::ArrayInsert { pos, value }) => {
            if *pos > items.len() {
                return Err("insert position out of range".to_string());
            }
            items.insert(*pos, value.clone());
            Ok(())
        }
        (Value::Array(items), Diff::ArrayDelete { pos, value }) => {
            if items.get(*pos) != Some(value) {
                return Err(format!("deleted element at {} does not match", pos));
            }
            items.remove(*pos);
            Ok(())
        }
        (_, diff) if diff.is_text() => Err("property is not a string".to_string()),
        _ => Err("property is not an array".to_string()),
    }
}

/// Byte offset of the `chars`-th character, allowing the end position
pub(crate) fn byte_offset(s: &str, chars: usize) -> Option<usize> {
    s.char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(s.len()))
        .nth(chars)
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}
