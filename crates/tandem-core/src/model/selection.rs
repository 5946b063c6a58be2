//! Selections carried inside changes

use serde::{Deserialize, Serialize};

use super::operation::Path;

/// A text selection on a string property, or nothing
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Selection {
    #[default]
    Null,
    #[serde(rename_all = "camelCase")]
    Property {
        path: Path,
        start_offset: usize,
        end_offset: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        surface_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_path: Option<Path>,
    },
}

impl Selection {
    /// Cursor at `offset`
    pub fn collapsed(path: Path, offset: usize) -> Self {
        Self::range(path, offset, offset)
    }

    pub fn range(path: Path, start_offset: usize, end_offset: usize) -> Self {
        Selection::Property {
            path,
            start_offset,
            end_offset,
            surface_id: None,
            container_path: None,
        }
    }

    pub fn with_surface(mut self, id: impl Into<String>) -> Self {
        if let Selection::Property { surface_id, .. } = &mut self {
            *surface_id = Some(id.into());
        }
        self
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Selection::Null)
    }

    pub fn is_collapsed(&self) -> bool {
        match self {
            Selection::Null => false,
            Selection::Property {
                start_offset,
                end_offset,
                ..
            } => start_offset == end_offset,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Selection::Null => None,
            Selection::Property { path, .. } => Some(path),
        }
    }

    pub fn offsets(&self) -> Option<(usize, usize)> {
        match self {
            Selection::Null => None,
            Selection::Property {
                start_offset,
                end_offset,
                ..
            } => Some((*start_offset, *end_offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::path;
    use serde_json::json;

    #[test]
    fn test_null_default() {
        let sel = Selection::default();
        assert!(sel.is_null());
        assert!(!sel.is_collapsed());
        assert_eq!(serde_json::to_value(&sel).unwrap(), json!({"type": "null"}));
    }

    #[test]
    fn test_property_wire_shape() {
        let sel = Selection::range(path(["p1", "content"]), 1, 4).with_surface("body");
        let value = serde_json::to_value(&sel).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "property",
                "path": ["p1", "content"],
                "startOffset": 1,
                "endOffset": 4,
                "surfaceId": "body"
            })
        );
        let parsed: Selection = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, sel);
    }

    #[test]
    fn test_collapsed() {
        let sel = Selection::collapsed(path(["p1", "content"]), 3);
        assert!(sel.is_collapsed());
        assert_eq!(sel.offsets(), Some((3, 3)));
    }
}
