//! Remote collaborators seen by a client session

use std::collections::{BTreeSet, HashMap};

use crate::model::Selection;

/// Hands out small integer indexes, reusing the lowest freed one first
#[derive(Debug, Clone, Default)]
pub struct IndexPool {
    next: usize,
    free: BTreeSet<usize>,
}

impl IndexPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> usize {
        if let Some(index) = self.free.pop_first() {
            return index;
        }
        let index = self.next;
        self.next += 1;
        index
    }

    pub fn release(&mut self, index: usize) {
        if index < self.next {
            self.free.insert(index);
        }
    }
}

/// A remote session editing the same document
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub session_id: String,
    /// Stable small number, used for colouring cursors
    pub session_index: usize,
    pub selection: Selection,
}

#[derive(Debug, Clone, Default)]
pub struct Collaborators {
    by_session: HashMap<String, Collaborator>,
    indexes: IndexPool,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest selection of a session, registering it if new
    pub fn upsert(&mut self, session_id: &str, selection: Selection) -> &Collaborator {
        let indexes = &mut self.indexes;
        let collaborator = self
            .by_session
            .entry(session_id.to_string())
            .or_insert_with(|| Collaborator {
                session_id: session_id.to_string(),
                session_index: indexes.acquire(),
                selection: Selection::Null,
            });
        collaborator.selection = selection;
        collaborator
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Collaborator> {
        let collaborator = self.by_session.remove(session_id)?;
        self.indexes.release(collaborator.session_index);
        Some(collaborator)
    }

    pub fn get(&self, session_id: &str) -> Option<&Collaborator> {
        self.by_session.get(session_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Collaborator> {
        self.by_session.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collaborator> {
        self.by_session.values()
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}
