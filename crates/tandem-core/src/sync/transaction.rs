//! Local edit transactions
//!
//! A [`Transaction`] applies each operation to the document as soon as it is
//! produced, so later steps observe earlier ones. [`Transaction::rollback`]
//! inverts everything applied so far; [`Transaction::finish`] packages the
//! applied ops into a [`Change`].

use serde_json::Value;

use crate::error::{CollabError, CollabResult};
use crate::model::document::char_len;
use crate::model::{Change, Diff, Document, Operation, Path, Selection};

pub struct Transaction<'a> {
    doc: &'a mut Document,
    ops: Vec<Operation>,
    before: Selection,
    selection: Selection,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(doc: &'a mut Document, selection: Selection) -> Self {
        Self {
            doc,
            ops: Vec::new(),
            before: selection.clone(),
            selection,
        }
    }

    /// Current document state, including this transaction's edits
    pub fn document(&self) -> &Document {
        self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Apply a raw operation
    pub fn apply(&mut self, op: Operation) -> CollabResult<()> {
        self.doc.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }

    /// Create a node; the object must carry an `id`
    pub fn create(&mut self, node: Value) -> CollabResult<()> {
        if node.get("id").and_then(Value::as_str).is_none() {
            return Err(CollabError::apply(&[], "node has no id"));
        }
        self.apply(Operation::create(node))
    }

    pub fn delete(&mut self, id: &str) -> CollabResult<()> {
        let path = vec![id.to_string()];
        let value = self
            .doc
            .get(id)
            .cloned()
            .ok_or_else(|| CollabError::apply(&path, "node does not exist"))?;
        self.apply(Operation::Delete { path, value })
    }

    pub fn set(&mut self, path: Path, value: Value) -> CollabResult<()> {
        let original = self.doc.get_path(&path).cloned().unwrap_or(Value::Null);
        self.apply(Operation::Set {
            path,
            value,
            original,
        })
    }

    pub fn insert_text(&mut self, path: Path, pos: usize, text: &str) -> CollabResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.apply(Operation::update(path, Diff::insert(pos, text)))
    }

    /// Delete `len` characters starting at `pos`
    pub fn delete_text(&mut self, path: Path, pos: usize, len: usize) -> CollabResult<()> {
        if len == 0 {
            return Ok(());
        }
        let current = self
            .doc
            .get_text(&path)
            .ok_or_else(|| CollabError::apply(&path, "property is not a string"))?;
        if pos + len > char_len(current) {
            return Err(CollabError::apply(&path, "delete range out of bounds"));
        }
        let removed: String = current.chars().skip(pos).take(len).collect();
        self.apply(Operation::update(path, Diff::delete(pos, removed)))
    }

    pub fn array_insert(&mut self, path: Path, pos: usize, value: Value) -> CollabResult<()> {
        self.apply(Operation::update(path, Diff::ArrayInsert { pos, value }))
    }

    pub fn array_delete(&mut self, path: Path, pos: usize) -> CollabResult<()> {
        let value = self
            .doc
            .get_path(&path)
            .and_then(Value::as_array)
            .and_then(|items| items.get(pos))
            .cloned()
            .ok_or_else(|| CollabError::apply(&path, "no array element at position"))?;
        self.apply(Operation::update(path, Diff::ArrayDelete { pos, value }))
    }

    /// Selection to record as the change's `after` state
    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = selection;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn rollback(self) {
        self.doc.revert(&self.ops);
    }

    pub(crate) fn finish(self) -> Change {
        Change::new(self.ops).with_selections(self.before, self.selection)
    }
}
