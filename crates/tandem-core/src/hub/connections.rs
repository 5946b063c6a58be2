//! Registry of live client connections
//!
//! Each connection has an outbound queue drained by its writer task, so
//! messages queued for one connection are delivered in order.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};

use crate::sync::ServerMessage;

pub type ConnectionId = u64;

#[derive(Debug)]
struct Entry {
    tx: mpsc::UnboundedSender<ServerMessage>,
    doc_id: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Default)]
struct Table {
    connections: HashMap<ConnectionId, Entry>,
    documents: HashMap<String, BTreeSet<ConnectionId>>,
}

/// What is known about a connection that went away
#[derive(Debug, Clone, PartialEq)]
pub struct Departed {
    pub doc_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    next_id: AtomicU64,
    table: RwLock<Table>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.table.write().await.connections.insert(
            id,
            Entry {
                tx,
                doc_id: None,
                session_id: None,
            },
        );
        id
    }

    /// Forget a connection; its queue closes once the entry is dropped
    pub async fn remove(&self, id: ConnectionId) -> Option<Departed> {
        let mut table = self.table.write().await;
        let entry = table.connections.remove(&id)?;
        if let Some(doc_id) = &entry.doc_id {
            if let Some(peers) = table.documents.get_mut(doc_id) {
                peers.remove(&id);
                if peers.is_empty() {
                    table.documents.remove(doc_id);
                }
            }
        }
        Some(Departed {
            doc_id: entry.doc_id,
            session_id: entry.session_id,
        })
    }

    /// Attach a connection to a document, leaving any previous one
    pub async fn join(&self, id: ConnectionId, doc_id: &str) -> bool {
        let mut table = self.table.write().await;
        let Some(entry) = table.connections.get_mut(&id) else {
            return false;
        };
        let previous = entry.doc_id.replace(doc_id.to_string());
        if let Some(previous) = previous.filter(|p| p != doc_id) {
            if let Some(peers) = table.documents.get_mut(&previous) {
                peers.remove(&id);
            }
        }
        table
            .documents
            .entry(doc_id.to_string())
            .or_default()
            .insert(id);
        true
    }

    /// Record the session id a connection speaks for
    pub async fn set_session(&self, id: ConnectionId, session_id: &str) {
        if let Some(entry) = self.table.write().await.connections.get_mut(&id) {
            if entry.session_id.as_deref() != Some(session_id) {
                entry.session_id = Some(session_id.to_string());
            }
        }
    }

    pub async fn document_of(&self, id: ConnectionId) -> Option<String> {
        let table = self.table.read().await;
        table.connections.get(&id).and_then(|e| e.doc_id.clone())
    }

    /// Queue a message for one connection
    pub async fn send(&self, id: ConnectionId, msg: ServerMessage) -> bool {
        let table = self.table.read().await;
        table
            .connections
            .get(&id)
            .is_some_and(|entry| entry.tx.send(msg).is_ok())
    }

    /// Queue a message for every connection on a document except `except`
    ///
    /// Returns how many connections it was queued for.
    pub async fn broadcast(&self, doc_id: &str, except: ConnectionId, msg: &ServerMessage) -> usize {
        let table = self.table.read().await;
        let Some(peers) = table.documents.get(doc_id) else {
            return 0;
        };
        peers
            .iter()
            .filter(|id| **id != except)
            .filter_map(|id| table.connections.get(id))
            .filter(|entry| entry.tx.send(msg.clone()).is_ok())
            .count()
    }

    pub async fn peers(&self, doc_id: &str) -> Vec<ConnectionId> {
        let table = self.table.read().await;
        table
            .documents
            .get(doc_id)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left(session: &str) -> ServerMessage {
        ServerMessage::CollaboratorLeft {
            session_id: session.to_string(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_other_documents() {
        let table = ConnectionTable::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        let a = table.register(tx1).await;
        let b = table.register(tx2).await;
        let c = table.register(tx3).await;
        table.join(a, "doc").await;
        table.join(b, "doc").await;
        table.join(c, "other").await;

        assert_eq!(table.broadcast("doc", a, &left("x")).await, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), left("x"));
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_reports_session() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = table.register(tx).await;
        table.join(id, "doc").await;
        table.set_session(id, "s1").await;

        let departed = table.remove(id).await.unwrap();
        assert_eq!(departed.doc_id.as_deref(), Some("doc"));
        assert_eq!(departed.session_id.as_deref(), Some("s1"));
        assert!(table.peers("doc").await.is_empty());
        assert!(table.remove(id).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_rejoin_moves_connection() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = table.register(tx).await;
        table.join(id, "a").await;
        table.join(id, "b").await;

        assert!(table.peers("a").await.is_empty());
        assert_eq!(table.peers("b").await, vec![id]);
        assert_eq!(table.document_of(id).await.as_deref(), Some("b"));
        assert!(!table.join(999, "a").await);
    }

    #[tokio::test]
    async fn test_send_to_closed_connection() {
        let table = ConnectionTable::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = table.register(tx).await;
        drop(rx);
        assert!(!table.send(id, left("x")).await);
        assert!(!table.send(42, left("x")).await);
    }
}
