//! # Change History
//!
//! Per-client undo/redo built from immutable changes.
//!
//! ## Design
//!
//! - `commit` pushes a local change onto `done` and discards `undone`
//! - `undo` applies the inverse of the newest done change and moves the
//!   original to `undone`
//! - `redo` re-applies the newest undone change and moves it back to `done`
//! - Replays are applied straight to the document, so they never re-enter
//!   the history; the caller commits the returned change to the hub
//!
//! History is linear: committing after an undo drops the undone branch.

use tracing::debug;

use crate::error::CollabResult;
use crate::model::{Change, Document};
use crate::transform::transform;

/// Default number of undo levels
pub const DEFAULT_MAX_LEVELS: usize = 100;

/// Undo/redo stacks for one client
#[derive(Debug, Clone)]
pub struct ChangeHistory {
    /// Applied local changes, most recent last
    done: Vec<Change>,
    /// Undone changes, most recent last
    undone: Vec<Change>,
    /// Maximum number of undo levels (0 = unlimited)
    max_levels: usize,
}

impl Default for ChangeHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHistory {
    pub fn new() -> Self {
        Self::with_max_levels(DEFAULT_MAX_LEVELS)
    }

    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            done: Vec::new(),
            undone: Vec::new(),
            max_levels,
        }
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    /// Change the undo depth, dropping the oldest levels that no longer fit
    pub fn set_max_levels(&mut self, max_levels: usize) {
        self.max_levels = max_levels;
        if max_levels > 0 && self.done.len() > max_levels {
            let excess = self.done.len() - max_levels;
            self.done.drain(..excess);
        }
    }

    /// Record a local change
    pub fn commit(&mut self, change: Change) {
        if change.is_empty() {
            return;
        }
        self.done.push(change);
        self.undone.clear();
        if self.max_levels > 0 && self.done.len() > self.max_levels {
            self.done.remove(0);
        }
    }

    /// Undo the newest change
    ///
    /// Returns the applied inverse, or `None` when there is nothing to undo.
    pub fn undo(&mut self, doc: &mut Document) -> CollabResult<Option<Change>> {
        let Some(change) = self.done.pop() else {
            return Ok(None);
        };
        let inverse = change.invert();
        if let Err(err) = doc.apply_change(&inverse) {
            self.done.push(change);
            return Err(err);
        }
        self.undone.push(change);
        Ok(Some(inverse))
    }

    /// Redo the newest undone change
    ///
    /// Returns the re-applied change under a fresh id.
    pub fn redo(&mut self, doc: &mut Document) -> CollabResult<Option<Change>> {
        let Some(change) = self.undone.pop() else {
            return Ok(None);
        };
        let replay = change.renewed();
        if let Err(err) = doc.apply_change(&replay) {
            self.undone.push(change);
            return Err(err);
        }
        self.done.push(change);
        Ok(Some(replay))
    }

    /// Rebase both stacks over a remote change that was just applied
    ///
    /// Undo walks back through `done`, so the remote change is moved across
    /// each entry's inverse, newest first. Redo replays `undone` forwards
    /// from the current document, so those entries are transformed as they
    /// are. When an entry conflicts, it and everything older is dropped.
    pub fn rebase(&mut self, remote: &Change) {
        if remote.is_empty() {
            return;
        }

        let mut incoming = remote.clone();
        for idx in (0..self.done.len()).rev() {
            let mut inverse = self.done[idx].invert();
            if let Err(err) = transform(&mut incoming, &mut inverse) {
                debug!("Dropping {} undo level(s) after conflict: {}", idx + 1, err);
                self.done.drain(..=idx);
                break;
            }
            let rebased = inverse.invert();
            let entry = &mut self.done[idx];
            entry.ops = rebased.ops;
            entry.before = rebased.before;
            entry.after = rebased.after;
        }

        let mut incoming = remote.clone();
        for idx in (0..self.undone.len()).rev() {
            if let Err(err) = transform(&mut incoming, &mut self.undone[idx]) {
                debug!("Dropping {} redo level(s) after conflict: {}", idx + 1, err);
                self.undone.drain(..=idx);
                break;
            }
        }

        self.done.retain(|c| !c.is_empty());
        self.undone.retain(|c| !c.is_empty());
    }

    pub fn can_undo(&self) -> bool {
        !self.done.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    pub fn done_len(&self) -> usize {
        self.done.len()
    }

    pub fn undone_len(&self) -> usize {
        self.undone.len()
    }

    pub fn clear(&mut self) {
        self.done.clear();
        self.undone.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{path, Diff, Operation};
    use serde_json::json;

    fn doc() -> Document {
        let mut doc = Document::new();
        doc.apply(&Operation::create(json!({"id": "p1", "content": "abc"})))
            .unwrap();
        doc
    }

    fn insert(pos: usize, text: &str) -> Change {
        Change::new(vec![Operation::update(
            path(["p1", "content"]),
            Diff::insert(pos, text),
        )])
    }

    fn commit(history: &mut ChangeHistory, doc: &mut Document, change: Change) {
        doc.apply_change(&change).unwrap();
        history.commit(change);
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        commit(&mut history, &mut doc, insert(3, "d"));
        commit(&mut history, &mut doc, insert(4, "e"));
        let expected = doc.clone();

        assert!(history.undo(&mut doc).unwrap().is_some());
        assert!(history.undo(&mut doc).unwrap().is_some());
        assert_eq!(doc.get_text(&path(["p1", "content"])), Some("abc"));
        assert_eq!((history.done_len(), history.undone_len()), (0, 2));

        assert!(history.redo(&mut doc).unwrap().is_some());
        assert!(history.redo(&mut doc).unwrap().is_some());
        assert_eq!(doc, expected);
        assert_eq!((history.done_len(), history.undone_len()), (2, 0));
    }

    #[test]
    fn test_undo_then_redo_is_noop() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        commit(&mut history, &mut doc, insert(0, "x"));
        let expected = doc.clone();

        history.undo(&mut doc).unwrap();
        history.redo(&mut doc).unwrap();
        assert_eq!(doc, expected);
        assert_eq!((history.done_len(), history.undone_len()), (1, 0));
    }

    #[test]
    fn test_commit_after_undo_discards_branch() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        commit(&mut history, &mut doc, insert(0, "x"));
        history.undo(&mut doc).unwrap();
        assert!(history.can_redo());

        commit(&mut history, &mut doc, insert(0, "y"));
        assert!(!history.can_redo());
        assert!(history.redo(&mut doc).unwrap().is_none());
    }

    #[test]
    fn test_empty_stacks() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        assert!(history.undo(&mut doc).unwrap().is_none());
        assert!(history.redo(&mut doc).unwrap().is_none());
    }

    #[test]
    fn test_shrinking_max_levels_drops_oldest() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        for text in ["1", "2", "3"] {
            commit(&mut history, &mut doc, insert(0, text));
        }

        history.set_max_levels(1);
        assert_eq!(history.max_levels(), 1);
        assert_eq!(history.done_len(), 1);
        history.undo(&mut doc).unwrap();
        assert_eq!(doc.get_text(&path(["p1", "content"])), Some("21abc"));
        assert!(!history.can_undo());
    }

    #[test]
    fn test_max_levels() {
        let mut doc = doc();
        let mut history = ChangeHistory::with_max_levels(2);
        for i in 0..4 {
            commit(&mut history, &mut doc, insert(i, "x"));
        }
        assert_eq!(history.done_len(), 2);
    }

    #[test]
    fn test_replay_gets_fresh_id() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        let change = insert(0, "x");
        let id = change.id.clone();
        commit(&mut history, &mut doc, change);

        let inverse = history.undo(&mut doc).unwrap().unwrap();
        let replay = history.redo(&mut doc).unwrap().unwrap();
        assert_ne!(inverse.id, id);
        assert_ne!(replay.id, id);
    }

    #[test]
    fn test_rebase_keeps_undo_valid_after_remote_edit() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        commit(&mut history, &mut doc, insert(3, "XYZ"));

        // Remote peer inserts at the front after our edit
        let remote = insert(0, "12");
        doc.apply_change(&remote).unwrap();
        history.rebase(&remote);

        history.undo(&mut doc).unwrap();
        assert_eq!(doc.get_text(&path(["p1", "content"])), Some("12abc"));
    }

    #[test]
    fn test_rebase_conflict_keeps_newer_levels() {
        let mut doc = Document::new();
        let mut history = ChangeHistory::new();
        commit(
            &mut history,
            &mut doc,
            Change::new(vec![Operation::create(json!({"id": "p1", "content": "abc"}))]),
        );
        commit(&mut history, &mut doc, insert(0, "X"));

        // Conflicts with undoing the create, not with undoing the insert
        let remote = insert(4, "Y");
        doc.apply_change(&remote).unwrap();
        history.rebase(&remote);
        assert_eq!(history.done_len(), 1);

        history.undo(&mut doc).unwrap();
        assert_eq!(doc.get_text(&path(["p1", "content"])), Some("abcY"));
    }

    #[test]
    fn test_rebase_moves_redo_entries() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        commit(&mut history, &mut doc, insert(3, "!"));
        history.undo(&mut doc).unwrap();

        let remote = insert(0, ">");
        doc.apply_change(&remote).unwrap();
        history.rebase(&remote);

        history.redo(&mut doc).unwrap();
        assert_eq!(doc.get_text(&path(["p1", "content"])), Some(">abc!"));
    }

    #[test]
    fn test_rebase_conflict_drops_stack() {
        let mut doc = doc();
        let mut history = ChangeHistory::new();
        commit(&mut history, &mut doc, insert(0, "x"));

        let remote = Change::new(vec![Operation::Delete {
            path: path(["p1"]),
            value: json!({"id": "p1", "content": "xabc"}),
        }]);
        history.rebase(&remote);
        assert!(!history.can_undo());
    }
}
