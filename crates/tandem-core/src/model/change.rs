//! Changes: the unit of commit, transmission and storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::operation::Operation;
use super::selection::Selection;

/// Editor state captured before or after a change
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeState {
    #[serde(default)]
    pub selection: Selection,
    /// Additional editor state, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChangeState {
    pub fn with_selection(selection: Selection) -> Self {
        Self {
            selection,
            extra: Map::new(),
        }
    }
}

/// Metadata about a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeInfo {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Version this change produced on the hub (set when accepted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Default for ChangeInfo {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: None,
            version: None,
        }
    }
}

/// An ordered batch of operations plus the selections around it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    pub ops: Vec<Operation>,
    #[serde(default)]
    pub before: ChangeState,
    #[serde(default)]
    pub after: ChangeState,
    #[serde(default)]
    pub info: ChangeInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Change {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ops,
            before: ChangeState::default(),
            after: ChangeState::default(),
            info: ChangeInfo::default(),
            session_id: None,
        }
    }

    /// A change that only carries a selection (never persisted)
    pub fn selection_only(selection: Selection) -> Self {
        Self::new(Vec::new()).with_selections(selection.clone(), selection)
    }

    pub fn with_selections(mut self, before: Selection, after: Selection) -> Self {
        self.before.selection = before;
        self.after.selection = after;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Copy of this change under a fresh id
    pub fn renewed(&self) -> Change {
        let mut change = self.clone();
        change.id = Uuid::new_v4().to_string();
        change.info = ChangeInfo {
            user_id: self.info.user_id.clone(),
            ..ChangeInfo::default()
        };
        change
    }

    /// The change that exactly reverses this one
    pub fn invert(&self) -> Change {
        let mut inverted = self.renewed();
        inverted.ops = self.ops.iter().rev().map(Operation::invert).collect();
        inverted.before = self.after.clone();
        inverted.after = self.before.clone();
        inverted
    }

    /// Fold a later local change into this one
    ///
    /// Ops are concatenated and `after` is replaced; `before` and `id` stay.
    pub fn merge(&mut self, later: Change) {
        self.ops.extend(later.ops);
        self.after = later.after;
        self.info.timestamp = later.info.timestamp;
    }
}
