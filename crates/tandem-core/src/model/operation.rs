//! Atomic document operations
//!
//! Every operation addresses one path (`[node_id, property, ...]`) and carries
//! everything needed to apply and invert it without looking at the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Address of a node (`[id]`) or of a property nested inside it
pub type Path = Vec<String>;

/// Build a path from string-like segments
pub fn path<I, S>(segments: I) -> Path
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    segments.into_iter().map(Into::into).collect()
}

/// Incremental edit of a string or array property
///
/// String positions are counted in chars, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Diff {
    Insert {
        pos: usize,
        #[serde(rename = "str")]
        text: String,
    },
    Delete {
        pos: usize,
        #[serde(rename = "str")]
        text: String,
    },
    ArrayInsert {
        pos: usize,
        value: Value,
    },
    ArrayDelete {
        pos: usize,
        value: Value,
    },
}

impl Diff {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Diff::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(pos: usize, text: impl Into<String>) -> Self {
        Diff::Delete {
            pos,
            text: text.into(),
        }
    }

    pub fn pos(&self) -> usize {
        match self {
            Diff::Insert { pos, .. }
            | Diff::Delete { pos, .. }
            | Diff::ArrayInsert { pos, .. }
            | Diff::ArrayDelete { pos, .. } => *pos,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Diff::Insert { .. } | Diff::Delete { .. })
    }

    pub fn invert(&self) -> Diff {
        match self {
            Diff::Insert { pos, text } => Diff::Delete {
                pos: *pos,
                text: text.clone(),
            },
            Diff::Delete { pos, text } => Diff::Insert {
                pos: *pos,
                text: text.clone(),
            },
            Diff::ArrayInsert { pos, value } => Diff::ArrayDelete {
                pos: *pos,
                value: value.clone(),
            },
            Diff::ArrayDelete { pos, value } => Diff::ArrayInsert {
                pos: *pos,
                value: value.clone(),
            },
        }
    }
}

/// An atomic, invertible edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    /// Add a node; `value` is the node object
    Create { path: Path, value: Value },
    /// Remove a node; `value` keeps the removed node for inversion
    Delete { path: Path, value: Value },
    /// Replace a property; `Null` means "absent"
    Set {
        path: Path,
        value: Value,
        #[serde(default)]
        original: Value,
    },
    /// Incremental string/array edit of a property
    Update { path: Path, diff: Diff },
}

impl Operation {
    /// Create operation for a node object carrying an `id` field
    pub fn create(node: Value) -> Self {
        let id = node
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Operation::Create {
            path: vec![id],
            value: node,
        }
    }

    pub fn update(path: Path, diff: Diff) -> Self {
        Operation::Update { path, diff }
    }

    pub fn path(&self) -> &Path {
        match self {
            Operation::Create { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Set { path, .. }
            | Operation::Update { path, .. } => path,
        }
    }

    /// Node id this operation touches
    pub fn node_id(&self) -> Option<&str> {
        self.path().first().map(String::as_str)
    }

    pub fn is_node_level(&self) -> bool {
        matches!(self, Operation::Create { .. } | Operation::Delete { .. })
    }

    pub fn invert(&self) -> Operation {
        match self {
            Operation::Create { path, value } => Operation::Delete {
                path: path.clone(),
                value: value.clone(),
            },
            Operation::Delete { path, value } => Operation::Create {
                path: path.clone(),
                value: value.clone(),
            },
            Operation::Set {
                path,
                value,
                original,
            } => Operation::Set {
                path: path.clone(),
                value: original.clone(),
                original: value.clone(),
            },
            Operation::Update { path, diff } => Operation::Update {
                path: path.clone(),
                diff: diff.invert(),
            },
        }
    }

    /// Short form used in logs and error messages, e.g. `update(/p1/content)`
    pub fn describe(&self) -> String {
        let kind = match self {
            Operation::Create { .. } => "create",
            Operation::Delete { .. } => "delete",
            Operation::Set { .. } => "set",
            Operation::Update { .. } => "update",
        };
        format!("{}(/{})", kind, self.path().join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_takes_id_from_node() {
        let op = Operation::create(json!({"id": "p1", "type": "paragraph"}));
        assert_eq!(op.path(), &path(["p1"]));
        assert!(op.is_node_level());
    }

    #[test]
    fn test_invert_is_involution() {
        let ops = vec![
            Operation::create(json!({"id": "p1"})),
            Operation::Set {
                path: path(["p1", "level"]),
                value: json!(2),
                original: json!(1),
            },
            Operation::update(path(["p1", "content"]), Diff::insert(3, "abc")),
            Operation::update(
                path(["list", "items"]),
                Diff::ArrayDelete {
                    pos: 0,
                    value: json!("p1"),
                },
            ),
        ];
        for op in ops {
            assert_eq!(op.invert().invert(), op);
        }
    }

    #[test]
    fn test_set_invert_swaps_values() {
        let op = Operation::Set {
            path: path(["p1", "level"]),
            value: json!(2),
            original: json!(1),
        };
        match op.invert() {
            Operation::Set {
                value, original, ..
            } => {
                assert_eq!(value, json!(1));
                assert_eq!(original, json!(2));
            }
            other => panic!("Expected set, got {:?}", other),
        }
    }

    #[test]
    fn test_wire_shape() {
        let op = Operation::update(path(["p1", "content"]), Diff::insert(0, "x"));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "update",
                "path": ["p1", "content"],
                "diff": {"type": "insert", "pos": 0, "str": "x"}
            })
        );
    }

    #[test]
    fn test_describe() {
        let op = Operation::update(path(["p1", "content"]), Diff::delete(0, "x"));
        assert_eq!(op.describe(), "update(/p1/content)");
    }
}
